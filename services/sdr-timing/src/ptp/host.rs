//! Host capability checks before launching the PTP daemons

use std::path::PathBuf;

/// Whether the process may adjust clocks and open PTP hardware
pub trait PrivilegeCheck: Send + Sync {
    fn has_privilege(&self) -> bool;
}

/// Checks the effective uid of the current process (root only)
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessPrivilege;

impl PrivilegeCheck for ProcessPrivilege {
    fn has_privilege(&self) -> bool {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| effective_uid(&status))
            .map_or(false, |uid| uid == 0)
    }
}

/// Effective uid from the `Uid:` line of /proc/<pid>/status
/// (`Uid: real effective saved filesystem`)
fn effective_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().nth(1))
        .and_then(|uid| uid.parse().ok())
}

/// PTP hardware clocks exposed by the kernel (`/dev/ptp0` .. `/dev/ptp9`)
pub fn find_ptp_devices() -> Vec<PathBuf> {
    (0..10)
        .map(|i| PathBuf::from(format!("/dev/ptp{}", i)))
        .filter(|path| path.exists())
        .collect()
}
