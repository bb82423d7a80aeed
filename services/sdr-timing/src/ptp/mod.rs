//! PTP clock synchronization
//!
//! A `ClockController` owns at most one session per device. The session state
//! machine is fed by a supervisor task reading ptp4l output, and its status is
//! shared so the sample path can check whether timestamps are comparable.

mod controller;
mod daemon;
mod host;
mod parse;
mod session;
mod state;

pub use controller::{ClockController, ClockError, ControllerOptions};
pub use daemon::{DaemonHandle, LaunchError, Ptp4lDaemon, SyncDaemon};
pub use host::{find_ptp_devices, PrivilegeCheck, ProcessPrivilege};
pub use parse::parse_ptp4l_line;
pub use session::{ClockSession, SessionConfig, SyncEvent};
pub use state::{
    ClockState, ClockStatus, FailureReason, OffsetSample, PeerEndpoint, Role, SessionSnapshot,
    SharedStatus,
};
