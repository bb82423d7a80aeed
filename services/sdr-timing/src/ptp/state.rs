//! Clock session states and the shared status other tasks read

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// PTP role of the local device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Slave,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(Role::Master),
            "slave" => Ok(Role::Slave),
            other => Err(format!("unknown PTP role '{}' (expected master or slave)", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Master => "master",
            Role::Slave => "slave",
        })
    }
}

/// Network interface carrying PTP, optionally with the expected peer address
///
/// Written as `eth0` or `eth0@192.168.1.20`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerEndpoint {
    pub interface: String,
    pub address: Option<String>,
}

impl FromStr for PeerEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (interface, address) = match s.split_once('@') {
            Some((iface, addr)) => (iface.trim(), Some(addr.trim())),
            None => (s, None),
        };
        if interface.is_empty() {
            return Err(format!("peer endpoint '{}' has no interface", s));
        }
        Ok(Self {
            interface: interface.to_string(),
            address: address.filter(|a| !a.is_empty()).map(str::to_string),
        })
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Some(addr) => write!(f, "{}@{}", self.interface, addr),
            None => f.write_str(&self.interface),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NegotiationTimeout,
    PrivilegeRequired,
    PeerUnreachable,
    HardwareUnsupported,
    /// The synchronization daemon exited on its own
    DaemonExited,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::NegotiationTimeout => "negotiation timeout",
            FailureReason::PrivilegeRequired => "privilege required",
            FailureReason::PeerUnreachable => "peer unreachable",
            FailureReason::HardwareUnsupported => "hardware timestamping unsupported",
            FailureReason::DaemonExited => "sync daemon exited",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockState {
    #[default]
    Idle,
    Requesting,
    Negotiating,
    Synchronized,
    Degraded,
    Stopped,
    Failed(FailureReason),
}

impl ClockState {
    /// Timestamps are comparable across devices only in this state
    pub fn is_synchronized(self) -> bool {
        self == ClockState::Synchronized
    }

    /// A session exists and has not ended
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ClockState::Requesting
                | ClockState::Negotiating
                | ClockState::Synchronized
                | ClockState::Degraded
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ClockState::Stopped | ClockState::Failed(_))
    }
}

impl fmt::Display for ClockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockState::Idle => f.write_str("Idle"),
            ClockState::Requesting => f.write_str("Requesting"),
            ClockState::Negotiating => f.write_str("Negotiating"),
            ClockState::Synchronized => f.write_str("Synchronized"),
            ClockState::Degraded => f.write_str("Degraded"),
            ClockState::Stopped => f.write_str("Stopped"),
            ClockState::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// One offset/delay measurement from the sync daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSample {
    pub offset_ns: i64,
    pub path_delay_ns: i64,
    /// The daemon's servo is locked (ptp4l state s2)
    pub locked: bool,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub state: ClockState,
    pub role: Option<Role>,
    pub peer: Option<PeerEndpoint>,
    pub offset_ns: Option<i64>,
    pub path_delay_ns: Option<i64>,
    pub last_update: Option<Instant>,
}

/// What `status()` reports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClockStatus {
    pub state: ClockState,
    pub offset_ns: Option<i64>,
    pub path_delay_ns: Option<i64>,
    #[serde(rename = "last_update_age_ms", serialize_with = "serialize_age_ms")]
    pub last_update_age: Option<Duration>,
}

fn serialize_age_ms<S: serde::Serializer>(
    age: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match age {
        Some(age) => serializer.serialize_some(&(age.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

impl SessionSnapshot {
    pub fn status_at(&self, now: Instant) -> ClockStatus {
        ClockStatus {
            state: self.state,
            offset_ns: self.offset_ns,
            path_delay_ns: self.path_delay_ns,
            last_update_age: self.last_update.map(|t| now.saturating_duration_since(t)),
        }
    }
}

/// Session snapshot shared between the clock supervisor and readers
///
/// The lock is held only to copy a snapshot in or out.
#[derive(Debug, Clone, Default)]
pub struct SharedStatus {
    inner: Arc<RwLock<SessionSnapshot>>,
}

impl SharedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn state(&self) -> ClockState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).state
    }

    pub fn report(&self) -> ClockStatus {
        self.snapshot().status_at(Instant::now())
    }

    pub fn publish(&self, snapshot: SessionSnapshot) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Change only the state, keeping the last measurements
    pub fn set_state(&self, state: ClockState) {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role() {
        assert_eq!("Master".parse::<Role>(), Ok(Role::Master));
        assert_eq!(" slave ".parse::<Role>(), Ok(Role::Slave));
        assert!("boundary".parse::<Role>().is_err());
    }

    #[test]
    fn test_parse_peer_endpoint() {
        let peer: PeerEndpoint = "eth0@192.168.1.20".parse().unwrap();
        assert_eq!(peer.interface, "eth0");
        assert_eq!(peer.address.as_deref(), Some("192.168.1.20"));
        assert_eq!(peer.to_string(), "eth0@192.168.1.20");

        let peer: PeerEndpoint = "enp3s0".parse().unwrap();
        assert_eq!(peer.address, None);

        assert!("@10.0.0.1".parse::<PeerEndpoint>().is_err());
    }

    #[test]
    fn test_state_predicates() {
        assert!(ClockState::Synchronized.is_synchronized());
        assert!(!ClockState::Degraded.is_synchronized());
        assert!(ClockState::Degraded.is_active());
        assert!(!ClockState::Idle.is_active());
        assert!(ClockState::Failed(FailureReason::PeerUnreachable).is_terminal());
        assert_eq!(
            ClockState::Failed(FailureReason::NegotiationTimeout).to_string(),
            "Failed(negotiation timeout)"
        );
    }

    #[test]
    fn test_status_reports_age() {
        let now = Instant::now();
        let status = SharedStatus::new();
        status.publish(SessionSnapshot {
            state: ClockState::Synchronized,
            offset_ns: Some(-42),
            path_delay_ns: Some(900),
            last_update: Some(now),
            ..SessionSnapshot::default()
        });

        let report = status.snapshot().status_at(now + Duration::from_millis(250));
        assert_eq!(report.state, ClockState::Synchronized);
        assert_eq!(report.offset_ns, Some(-42));
        assert_eq!(report.last_update_age, Some(Duration::from_millis(250)));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "synchronized");
        assert_eq!(json["last_update_age_ms"], 250);
    }
}
