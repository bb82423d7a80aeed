//! SDR acquisition, live waterfall spectrum and PTP-gated delay measurement
//!
//! Sources produce timestamped sample blocks, the spectrum pipeline turns them
//! into waterfall rows, and the correlator measures the delay between two
//! streams once the clock sessions report both hosts synchronized.

pub mod config;
pub mod device;
pub mod ptp;
pub mod sdr;
pub mod spectrum;
pub mod tdoa;
pub mod timed_capture;
pub mod timing;
