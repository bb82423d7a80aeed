//! Sample source adapters
//!
//! Each driver turns a device into a pull-based stream of timestamped
//! complex sample blocks:
//! 1. `rtl_sdr` subprocess for local RTL-SDR dongles
//! 2. `rtl_tcp` client for remote dongles
//! 3. Synthetic tones, noise and pulses for dry runs

pub mod args;
pub mod block;
pub mod capture;
mod demod;
pub mod remote;
pub mod source;
pub mod synthetic;

pub use args::{ArgsError, DeviceArgs, Driver};
pub use block::{HardwareTimestamp, SampleBlock, SourceId};
pub use demod::IqTable;
pub use source::{open, OpenOptions, ReadOutcome, SampleSource, SourceError, TuningParams};
