//! Per-device acquisition and processing

pub mod acquisition;
pub mod manager;
pub mod state;

pub use acquisition::{Acquisition, AcquisitionEvent, AcquisitionPolicy};
pub use manager::{DeviceHandle, DeviceManager, DeviceSettings};
pub use state::DeviceStats;
