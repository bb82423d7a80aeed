//! Clock controller - owns the single clock session of this device and the
//! supervisor task driving it

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::daemon::{DaemonHandle, LaunchError, SyncDaemon};
use super::host::PrivilegeCheck;
use super::session::{ClockSession, SessionConfig, SyncEvent};
use super::state::{
    ClockState, ClockStatus, FailureReason, OffsetSample, PeerEndpoint, Role, SharedStatus,
};

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("a clock session is already active ({0})")]
    SessionActive(ClockState),
    #[error("PTP requires root privileges (clock adjustment and hardware timestamping)")]
    PrivilegeRequired,
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub session: SessionConfig,
    /// How often time-based rules are evaluated
    pub poll_interval: Duration,
    /// Bound on waiting for the daemon and supervisor to stop
    pub stop_grace: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            poll_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(3),
        }
    }
}

struct ActiveSession {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ClockController {
    daemon: Arc<dyn SyncDaemon>,
    privilege: Arc<dyn PrivilegeCheck>,
    options: ControllerOptions,
    status: SharedStatus,
    active: Mutex<Option<ActiveSession>>,
}

impl ClockController {
    pub fn new(
        daemon: Arc<dyn SyncDaemon>,
        privilege: Arc<dyn PrivilegeCheck>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            daemon,
            privilege,
            options,
            status: SharedStatus::new(),
            active: Mutex::new(None),
        }
    }

    /// Begin a synchronization session
    pub async fn start(&self, role: Role, peer: PeerEndpoint) -> Result<(), ClockError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            let state = self.status.state();
            if !previous.task.is_finished() && !state.is_terminal() {
                *active = Some(previous);
                return Err(ClockError::SessionActive(state));
            }
            // A failed session's supervisor may still be releasing its daemon
            join_or_abort(previous.task, self.options.stop_grace * 2).await;
        }

        info!("===========================================");
        info!("  Starting PTP session");
        info!("  Role: {}", role);
        info!("  Peer: {}", peer);
        info!("===========================================");

        let mut session = ClockSession::new(
            role,
            peer.clone(),
            self.options.session.clone(),
            Instant::now(),
        );
        self.status.publish(session.snapshot());

        if !self.privilege.has_privilege() {
            session.fail(FailureReason::PrivilegeRequired);
            self.status.publish(session.snapshot());
            return Err(ClockError::PrivilegeRequired);
        }

        let handle = match self.daemon.launch(role, &peer) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to launch PTP daemon: {}", e);
                session.fail(e.reason());
                self.status.publish(session.snapshot());
                return Err(e.into());
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            session,
            handle,
            shutdown_rx,
            self.status.clone(),
            self.options.poll_interval,
            self.options.stop_grace,
        ));

        *active = Some(ActiveSession {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// End the session. A no-op from Idle or Stopped.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(ActiveSession { shutdown, task }) => {
                let _ = shutdown.send(());
                join_or_abort(task, self.options.stop_grace * 2).await;
                self.status.set_state(ClockState::Stopped);
                info!("PTP session stopped");
            }
            None => {
                if let ClockState::Failed(_) = self.status.state() {
                    self.status.set_state(ClockState::Stopped);
                }
            }
        }
    }

    /// Current state and last measurements. Never waits on the supervisor.
    pub fn status(&self) -> ClockStatus {
        self.status.report()
    }

    pub fn state(&self) -> ClockState {
        self.status.state()
    }

    /// Shared status for timestamp comparability checks
    pub fn status_handle(&self) -> SharedStatus {
        self.status.clone()
    }
}

/// Wait up to `bound` for a supervisor to finish and abort it otherwise.
/// Returns false when it was aborted.
async fn join_or_abort(mut task: JoinHandle<()>, bound: Duration) -> bool {
    if tokio::time::timeout(bound, &mut task).await.is_ok() {
        return true;
    }
    warn!("Clock supervisor did not stop within {:?}, aborting", bound);
    task.abort();
    false
}

/// Supervisor task: feeds daemon events and clock ticks into the session
async fn supervise(
    mut session: ClockSession,
    mut handle: DaemonHandle,
    mut shutdown: oneshot::Receiver<()>,
    status: SharedStatus,
    poll_interval: Duration,
    stop_grace: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let stopped = loop {
        tokio::select! {
            _ = &mut shutdown => break true,
            event = handle.next_event() => {
                let event = event.unwrap_or(SyncEvent::DaemonExited);
                session.apply(event, Instant::now());
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                // A grandmaster reports no offsets; while its daemon runs the
                // local clock is the reference
                if session.role() == Role::Master && session.state() != ClockState::Requesting {
                    session.apply(
                        SyncEvent::Offset(OffsetSample {
                            offset_ns: 0,
                            path_delay_ns: 0,
                            locked: true,
                        }),
                        now,
                    );
                }
                session.tick(now);
            }
        }

        status.publish(session.snapshot());
        if session.state().is_terminal() {
            break false;
        }
    };

    handle.release(stop_grace).await;
    if stopped {
        session.stop();
    }
    status.publish(session.snapshot());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct FakeDaemon {
        launches: AtomicUsize,
        releases: Arc<AtomicUsize>,
        events: std::sync::Mutex<Option<mpsc::Sender<SyncEvent>>>,
    }

    impl FakeDaemon {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                releases: Arc::new(AtomicUsize::new(0)),
                events: std::sync::Mutex::new(None),
            })
        }

        async fn send(&self, event: SyncEvent) {
            let tx = self.events.lock().unwrap().clone().unwrap();
            tx.send(event).await.unwrap();
        }
    }

    impl SyncDaemon for FakeDaemon {
        fn launch(&self, _role: Role, _peer: &PeerEndpoint) -> Result<DaemonHandle, LaunchError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            *self.events.lock().unwrap() = Some(tx);

            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let releases = self.releases.clone();
            let task = tokio::spawn(async move {
                let _ = shutdown_rx.await;
                releases.fetch_add(1, Ordering::SeqCst);
            });
            Ok(DaemonHandle::new(rx, shutdown_tx, task))
        }
    }

    struct Privilege(AtomicBool);

    impl PrivilegeCheck for Privilege {
        fn has_privilege(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn controller(daemon: Arc<FakeDaemon>, privileged: bool, session: SessionConfig) -> ClockController {
        ClockController::new(
            daemon,
            Arc::new(Privilege(AtomicBool::new(privileged))),
            ControllerOptions {
                session,
                poll_interval: Duration::from_millis(10),
                stop_grace: Duration::from_millis(500),
            },
        )
    }

    async fn wait_for(controller: &ClockController, state: ClockState) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while controller.state() != state {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {}, state is {}",
                state,
                controller.state()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn synchronize(daemon: &FakeDaemon) {
        daemon.send(SyncEvent::PeerDiscovered).await;
        for _ in 0..4 {
            daemon
                .send(SyncEvent::Offset(OffsetSample {
                    offset_ns: 15,
                    path_delay_ns: 700,
                    locked: true,
                }))
                .await;
        }
    }

    fn peer() -> PeerEndpoint {
        "eth0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_stop_from_idle_is_noop() {
        let daemon = FakeDaemon::new();
        let controller = controller(daemon.clone(), true, SessionConfig::default());
        controller.stop().await;
        assert_eq!(controller.state(), ClockState::Idle);
        assert_eq!(daemon.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_synchronize_then_stop_releases_once() {
        let daemon = FakeDaemon::new();
        let controller = controller(daemon.clone(), true, SessionConfig::default());

        controller.start(Role::Slave, peer()).await.unwrap();
        assert!(matches!(
            controller.start(Role::Slave, peer()).await,
            Err(ClockError::SessionActive(_))
        ));

        synchronize(&daemon).await;
        wait_for(&controller, ClockState::Synchronized).await;

        let status = controller.status();
        assert_eq!(status.offset_ns, Some(15));
        assert_eq!(status.path_delay_ns, Some(700));
        assert!(status.last_update_age.is_some());

        controller.stop().await;
        assert_eq!(controller.state(), ClockState::Stopped);
        assert_eq!(daemon.releases.load(Ordering::SeqCst), 1);

        controller.stop().await;
        assert_eq!(controller.state(), ClockState::Stopped);
        assert_eq!(daemon.releases.load(Ordering::SeqCst), 1);
        assert_eq!(daemon.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_privilege_fails_without_launch() {
        let daemon = FakeDaemon::new();
        let controller = controller(daemon.clone(), false, SessionConfig::default());

        let result = controller.start(Role::Slave, peer()).await;
        assert!(matches!(result, Err(ClockError::PrivilegeRequired)));
        assert_eq!(
            controller.state(),
            ClockState::Failed(FailureReason::PrivilegeRequired)
        );
        assert_eq!(daemon.launches.load(Ordering::SeqCst), 0);

        controller.stop().await;
        assert_eq!(controller.state(), ClockState::Stopped);
    }

    #[tokio::test]
    async fn test_staleness_degrades_session() {
        let daemon = FakeDaemon::new();
        let controller = controller(
            daemon.clone(),
            true,
            SessionConfig {
                staleness: Duration::from_millis(200),
                ..SessionConfig::default()
            },
        );

        controller.start(Role::Slave, peer()).await.unwrap();
        synchronize(&daemon).await;
        wait_for(&controller, ClockState::Synchronized).await;

        // No further samples
        wait_for(&controller, ClockState::Degraded).await;
        controller.stop().await;
        assert_eq!(daemon.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negotiation_timeout_fails_and_releases() {
        let daemon = FakeDaemon::new();
        let controller = controller(
            daemon.clone(),
            true,
            SessionConfig {
                negotiation_timeout: Duration::from_millis(50),
                ..SessionConfig::default()
            },
        );

        controller.start(Role::Slave, peer()).await.unwrap();
        daemon.send(SyncEvent::PeerDiscovered).await;
        wait_for(
            &controller,
            ClockState::Failed(FailureReason::NegotiationTimeout),
        )
        .await;

        // The supervisor released the daemon when the session failed
        let deadline = Instant::now() + Duration::from_secs(1);
        while daemon.releases.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(daemon.releases.load(Ordering::SeqCst), 1);

        // A failed session can be replaced by a fresh one
        controller.start(Role::Slave, peer()).await.unwrap();
        assert_eq!(daemon.launches.load(Ordering::SeqCst), 2);
        controller.stop().await;
        assert_eq!(daemon.releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hung_supervisor_is_aborted() {
        let (alive_tx, alive_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        });

        assert!(!join_or_abort(task, Duration::from_millis(20)).await);
        // The aborted task dropped its sender
        assert!(alive_rx.await.is_err());

        let done = tokio::spawn(async {});
        assert!(join_or_abort(done, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_master_uses_local_reference() {
        let daemon = FakeDaemon::new();
        let controller = controller(daemon.clone(), true, SessionConfig::default());

        controller.start(Role::Master, peer()).await.unwrap();
        daemon.send(SyncEvent::PeerDiscovered).await;
        wait_for(&controller, ClockState::Synchronized).await;
        assert_eq!(controller.status().offset_ns, Some(0));

        controller.stop().await;
        assert_eq!(controller.state(), ClockState::Stopped);
    }
}
