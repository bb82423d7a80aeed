//! Synchronization session state machine
//!
//! Pure logic: events and clock ticks go in, state transitions come out. Time
//! is passed in explicitly so the transitions can be driven deterministically.

use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::state::{
    ClockState, FailureReason, OffsetSample, PeerEndpoint, Role, SessionSnapshot,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Largest |offset| that counts toward synchronization
    pub offset_limit_ns: i64,
    /// Consecutive in-bound samples needed to become Synchronized
    pub stable_samples: u32,
    /// Synchronized degrades when no sample arrives within this window
    pub staleness: Duration,
    /// Sessions not Synchronized this long after start fail
    pub negotiation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            offset_limit_ns: 1_000,
            stable_samples: 4,
            staleness: Duration::from_secs(5),
            negotiation_timeout: Duration::from_secs(30),
        }
    }
}

/// Input observed from the synchronization daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    PeerDiscovered,
    Offset(OffsetSample),
    PeerUnreachable,
    HardwareUnsupported,
    DaemonExited,
}

/// One synchronization attempt
#[derive(Debug, Clone)]
pub struct ClockSession {
    role: Role,
    peer: PeerEndpoint,
    config: SessionConfig,
    state: ClockState,
    created: Instant,
    offset_ns: Option<i64>,
    path_delay_ns: Option<i64>,
    last_update: Option<Instant>,
    in_bound_run: u32,
}

impl ClockSession {
    pub fn new(role: Role, peer: PeerEndpoint, config: SessionConfig, now: Instant) -> Self {
        Self {
            role,
            peer,
            config,
            state: ClockState::Requesting,
            created: now,
            offset_ns: None,
            path_delay_ns: None,
            last_update: None,
            in_bound_run: 0,
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            role: Some(self.role),
            peer: Some(self.peer.clone()),
            offset_ns: self.offset_ns,
            path_delay_ns: self.path_delay_ns,
            last_update: self.last_update,
        }
    }

    fn transition(&mut self, next: ClockState) {
        if next == self.state {
            return;
        }
        match next {
            ClockState::Failed(reason) => {
                warn!("[PTP {}] {} -> Failed({})", self.peer, self.state, reason)
            }
            ClockState::Degraded => warn!("[PTP {}] {} -> Degraded", self.peer, self.state),
            _ => info!("[PTP {}] {} -> {}", self.peer, self.state, next),
        }
        self.state = next;
    }

    fn in_bound(&self, sample: &OffsetSample) -> bool {
        sample.locked && sample.offset_ns.abs() <= self.config.offset_limit_ns
    }

    pub fn apply(&mut self, event: SyncEvent, now: Instant) -> ClockState {
        if self.state.is_terminal() {
            return self.state;
        }

        match event {
            SyncEvent::PeerDiscovered => {
                if self.state == ClockState::Requesting {
                    self.transition(ClockState::Negotiating);
                }
            }
            SyncEvent::Offset(sample) => {
                self.offset_ns = Some(sample.offset_ns);
                self.path_delay_ns = Some(sample.path_delay_ns);
                self.last_update = Some(now);

                if self.state == ClockState::Requesting {
                    self.transition(ClockState::Negotiating);
                }

                if self.in_bound(&sample) {
                    self.in_bound_run = self.in_bound_run.saturating_add(1);
                } else {
                    self.in_bound_run = 0;
                }

                match self.state {
                    ClockState::Negotiating | ClockState::Degraded
                        if self.in_bound_run >= self.config.stable_samples =>
                    {
                        self.transition(ClockState::Synchronized);
                    }
                    ClockState::Synchronized if self.in_bound_run == 0 => {
                        self.transition(ClockState::Degraded);
                    }
                    _ => {}
                }
            }
            SyncEvent::PeerUnreachable => self.fail(FailureReason::PeerUnreachable),
            SyncEvent::HardwareUnsupported => self.fail(FailureReason::HardwareUnsupported),
            SyncEvent::DaemonExited => self.fail(FailureReason::DaemonExited),
        }

        self.state
    }

    /// Apply the time-based rules: negotiation timeout and staleness
    pub fn tick(&mut self, now: Instant) -> ClockState {
        match self.state {
            ClockState::Requesting | ClockState::Negotiating => {
                if now.saturating_duration_since(self.created) >= self.config.negotiation_timeout {
                    self.fail(FailureReason::NegotiationTimeout);
                }
            }
            ClockState::Synchronized => {
                let stale = match self.last_update {
                    Some(t) => now.saturating_duration_since(t) > self.config.staleness,
                    None => true,
                };
                if stale {
                    self.in_bound_run = 0;
                    self.transition(ClockState::Degraded);
                }
            }
            _ => {}
        }
        self.state
    }

    pub fn fail(&mut self, reason: FailureReason) {
        if !self.state.is_terminal() {
            self.transition(ClockState::Failed(reason));
        }
    }

    pub fn stop(&mut self) {
        self.transition(ClockState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locked(offset_ns: i64) -> SyncEvent {
        SyncEvent::Offset(OffsetSample {
            offset_ns,
            path_delay_ns: 500,
            locked: true,
        })
    }

    fn session(t0: Instant) -> ClockSession {
        ClockSession::new(
            Role::Slave,
            "eth0".parse().unwrap(),
            SessionConfig::default(),
            t0,
        )
    }

    fn synchronized(t0: Instant) -> ClockSession {
        let mut s = session(t0);
        for i in 0..4 {
            s.apply(locked(10), t0 + Duration::from_millis(i * 100));
        }
        assert_eq!(s.state(), ClockState::Synchronized);
        s
    }

    #[test]
    fn test_negotiation_to_synchronized_needs_stable_run() {
        let t0 = Instant::now();
        let mut s = session(t0);
        assert_eq!(s.state(), ClockState::Requesting);

        assert_eq!(s.apply(SyncEvent::PeerDiscovered, t0), ClockState::Negotiating);
        s.apply(locked(10), t0);
        s.apply(locked(20), t0);
        s.apply(locked(5_000), t0);
        s.apply(locked(10), t0);
        s.apply(locked(10), t0);
        assert_eq!(s.state(), ClockState::Negotiating);
        assert_eq!(s.apply(locked(-10), t0), ClockState::Negotiating);
        assert_eq!(s.apply(locked(-10), t0), ClockState::Synchronized);
        assert_eq!(s.snapshot().offset_ns, Some(-10));
    }

    #[test]
    fn test_unlocked_servo_does_not_count() {
        let t0 = Instant::now();
        let mut s = session(t0);
        for _ in 0..10 {
            s.apply(
                SyncEvent::Offset(OffsetSample {
                    offset_ns: 0,
                    path_delay_ns: 0,
                    locked: false,
                }),
                t0,
            );
        }
        assert_eq!(s.state(), ClockState::Negotiating);
    }

    #[test]
    fn test_out_of_bound_sample_degrades_and_recovers() {
        let t0 = Instant::now();
        let mut s = synchronized(t0);
        assert_eq!(s.apply(locked(50_000), t0), ClockState::Degraded);
        for _ in 0..3 {
            s.apply(locked(1), t0);
        }
        assert_eq!(s.state(), ClockState::Degraded);
        assert_eq!(s.apply(locked(1), t0), ClockState::Synchronized);
    }

    #[test]
    fn test_staleness_degrades() {
        let t0 = Instant::now();
        let mut s = synchronized(t0);
        let last = t0 + Duration::from_millis(300);
        assert_eq!(s.tick(last + Duration::from_secs(4)), ClockState::Synchronized);
        assert_eq!(s.tick(last + Duration::from_secs(6)), ClockState::Degraded);
        // Staleness never fails a session outright
        assert_eq!(s.tick(last + Duration::from_secs(60)), ClockState::Degraded);
    }

    #[test]
    fn test_negotiation_timeout() {
        let t0 = Instant::now();
        let mut s = session(t0);
        s.apply(SyncEvent::PeerDiscovered, t0);
        assert_eq!(s.tick(t0 + Duration::from_secs(29)), ClockState::Negotiating);
        assert_eq!(
            s.tick(t0 + Duration::from_secs(30)),
            ClockState::Failed(FailureReason::NegotiationTimeout)
        );
    }

    #[test]
    fn test_failed_is_terminal() {
        let t0 = Instant::now();
        let mut s = session(t0);
        assert_eq!(
            s.apply(SyncEvent::PeerUnreachable, t0),
            ClockState::Failed(FailureReason::PeerUnreachable)
        );
        for _ in 0..10 {
            s.apply(locked(0), t0);
        }
        assert_eq!(s.state(), ClockState::Failed(FailureReason::PeerUnreachable));
        s.fail(FailureReason::DaemonExited);
        assert_eq!(s.state(), ClockState::Failed(FailureReason::PeerUnreachable));

        s.stop();
        assert_eq!(s.state(), ClockState::Stopped);
    }
}
