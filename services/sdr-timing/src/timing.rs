//! Cross-device timestamp comparison
//!
//! Timestamps from different sources live in different clock domains until
//! both clocks are synchronized. Comparing them otherwise is an error, not an
//! approximation.

use std::collections::HashMap;
use thiserror::Error;

use crate::ptp::{ClockState, SharedStatus};
use crate::sdr::{HardwareTimestamp, SourceId};

/// Clock state lookup by source
pub trait SyncQuery {
    fn clock_state(&self, source: &SourceId) -> ClockState;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timestamps of {stream} are not comparable: clock is {state}")]
pub struct NotComparable {
    pub stream: SourceId,
    pub state: ClockState,
}

/// Sources mapped to the clock session that disciplines their host
///
/// Sources without a session report `Idle`.
#[derive(Debug, Clone, Default)]
pub struct ClockRegistry {
    sources: HashMap<SourceId, SharedStatus>,
}

impl ClockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: SourceId, status: SharedStatus) {
        self.sources.insert(source, status);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl SyncQuery for ClockRegistry {
    fn clock_state(&self, source: &SourceId) -> ClockState {
        self.sources
            .get(source)
            .map_or(ClockState::Idle, SharedStatus::state)
    }
}

impl SyncQuery for HashMap<SourceId, ClockState> {
    fn clock_state(&self, source: &SourceId) -> ClockState {
        self.get(source).copied().unwrap_or_default()
    }
}

/// Fails with the first source whose clock is not synchronized
pub fn ensure_comparable(
    a: &SourceId,
    b: &SourceId,
    sync: &dyn SyncQuery,
) -> Result<(), NotComparable> {
    if a == b {
        return Ok(());
    }
    for source in [a, b] {
        let state = sync.clock_state(source);
        if !state.is_synchronized() {
            return Err(NotComparable {
                stream: source.clone(),
                state,
            });
        }
    }
    Ok(())
}

/// `b - a` in nanoseconds
///
/// Timestamps of the same source are always comparable.
pub fn time_difference_ns(
    a_source: &SourceId,
    a: HardwareTimestamp,
    b_source: &SourceId,
    b: HardwareTimestamp,
    sync: &dyn SyncQuery,
) -> Result<i64, NotComparable> {
    ensure_comparable(a_source, b_source, sync)?;
    Ok(b.nanos() - a.nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::SessionSnapshot;

    #[test]
    fn test_same_source_always_comparable() {
        let states: HashMap<SourceId, ClockState> = HashMap::new();
        let a = SourceId::new("a");
        let diff = time_difference_ns(
            &a,
            HardwareTimestamp::from_nanos(100),
            &a,
            HardwareTimestamp::from_nanos(350),
            &states,
        );
        assert_eq!(diff, Ok(250));
    }

    #[test]
    fn test_cross_source_requires_synchronized() {
        let a = SourceId::new("a");
        let b = SourceId::new("b");
        let mut states = HashMap::new();
        states.insert(a.clone(), ClockState::Synchronized);
        states.insert(b.clone(), ClockState::Degraded);

        let err = time_difference_ns(
            &a,
            HardwareTimestamp::from_nanos(0),
            &b,
            HardwareTimestamp::from_nanos(10),
            &states,
        )
        .unwrap_err();
        assert_eq!(err.stream, b);
        assert_eq!(err.state, ClockState::Degraded);

        states.insert(b.clone(), ClockState::Synchronized);
        assert_eq!(
            time_difference_ns(
                &a,
                HardwareTimestamp::from_nanos(0),
                &b,
                HardwareTimestamp::from_nanos(10),
                &states
            ),
            Ok(10)
        );
    }

    #[test]
    fn test_registry_defaults_to_idle() {
        let status = SharedStatus::new();
        status.publish(SessionSnapshot {
            state: ClockState::Synchronized,
            ..SessionSnapshot::default()
        });

        let mut registry = ClockRegistry::new();
        registry.register(SourceId::new("a"), status.clone());

        assert_eq!(registry.clock_state(&SourceId::new("a")), ClockState::Synchronized);
        assert_eq!(registry.clock_state(&SourceId::new("zz")), ClockState::Idle);

        status.set_state(ClockState::Degraded);
        assert_eq!(registry.clock_state(&SourceId::new("a")), ClockState::Degraded);
    }
}
