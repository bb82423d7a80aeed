//! PTP daemon runner - spawns ptp4l (and phc2sys for slaves) and turns their
//! output into session events

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::host::find_ptp_devices;
use super::parse::parse_ptp4l_line;
use super::session::SyncEvent;
use super::state::{FailureReason, PeerEndpoint, Role};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{program} is not installed or not executable: {source}")]
    NotInstalled {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("no PTP hardware clock (/dev/ptp*) found")]
    NoHardwareClock,
    #[error("failed to launch {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    /// Session failure this launch error maps to
    pub fn reason(&self) -> FailureReason {
        match self {
            LaunchError::NotInstalled { .. } | LaunchError::NoHardwareClock => {
                FailureReason::HardwareUnsupported
            }
            LaunchError::Io { .. } => FailureReason::DaemonExited,
        }
    }
}

/// Running synchronization daemon
///
/// Events arrive through `next_event`; `release` stops the daemon and consumes
/// the handle, so resources are released exactly once.
pub struct DaemonHandle {
    events: mpsc::Receiver<SyncEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DaemonHandle {
    pub fn new(
        events: mpsc::Receiver<SyncEvent>,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// `None` once the daemon can produce no more events
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    pub async fn release(mut self, grace: Duration) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!("PTP daemon did not stop within {:?}, aborting", grace);
                task.abort();
            }
        }
    }
}

/// Launches the synchronization daemon for a session
pub trait SyncDaemon: Send + Sync {
    /// Must be called from within a tokio runtime
    fn launch(&self, role: Role, peer: &PeerEndpoint) -> Result<DaemonHandle, LaunchError>;
}

/// linuxptp: `ptp4l` on the interface, plus `phc2sys` to discipline the
/// system clock from the NIC clock in slave role
#[derive(Debug, Clone)]
pub struct Ptp4lDaemon {
    pub ptp4l_path: PathBuf,
    pub phc2sys_path: PathBuf,
    pub discipline_system_clock: bool,
}

impl Default for Ptp4lDaemon {
    fn default() -> Self {
        Self {
            ptp4l_path: PathBuf::from("ptp4l"),
            phc2sys_path: PathBuf::from("phc2sys"),
            discipline_system_clock: true,
        }
    }
}

fn spawn_error(program: &str, source: io::Error) -> LaunchError {
    if source.kind() == io::ErrorKind::NotFound {
        LaunchError::NotInstalled {
            program: program.to_string(),
            source,
        }
    } else {
        LaunchError::Io {
            program: program.to_string(),
            source,
        }
    }
}

fn spawn_logged(cmd: &mut Command, program: &str) -> Result<Child, LaunchError> {
    info!("Starting {}: {:?}", program, cmd.as_std());
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, e))
}

/// Forward lines to the log; ptp4l lines are also parsed into events
fn forward_lines<R>(
    reader: R,
    program: &'static str,
    events: Option<mpsc::Sender<SyncEvent>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let Some(tx) = events.as_ref() else {
                debug!("[{}] {}", program, line);
                continue;
            };
            match parse_ptp4l_line(&line) {
                Some(event @ SyncEvent::Offset(_)) => {
                    debug!("[{}] {}", program, line);
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Some(event) => {
                    info!("[{}] {}", program, line);
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                None => info!("[{}] {}", program, line),
            }
        }
    })
}

async fn wait_optional(child: &mut Option<Child>) -> io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

impl SyncDaemon for Ptp4lDaemon {
    fn launch(&self, role: Role, peer: &PeerEndpoint) -> Result<DaemonHandle, LaunchError> {
        let clocks = find_ptp_devices();
        if clocks.is_empty() {
            return Err(LaunchError::NoHardwareClock);
        }
        debug!("PTP hardware clocks: {:?}", clocks);

        // ptp4l -i <iface> -m [-s]
        let mut cmd = Command::new(&self.ptp4l_path);
        cmd.arg("-i").arg(&peer.interface).arg("-m");
        if role == Role::Slave {
            cmd.arg("-s");
        }
        let mut ptp4l = spawn_logged(&mut cmd, "ptp4l")?;

        // phc2sys -s <iface> -c CLOCK_REALTIME -w -m
        let mut phc2sys = if role == Role::Slave && self.discipline_system_clock {
            let mut cmd = Command::new(&self.phc2sys_path);
            cmd.arg("-s")
                .arg(&peer.interface)
                .arg("-c")
                .arg("CLOCK_REALTIME")
                .arg("-w")
                .arg("-m");
            Some(spawn_logged(&mut cmd, "phc2sys")?)
        } else {
            None
        };

        let (event_tx, event_rx) = mpsc::channel::<SyncEvent>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        if let Some(stdout) = ptp4l.stdout.take() {
            forward_lines(stdout, "ptp4l", Some(event_tx.clone()));
        }
        if let Some(stderr) = ptp4l.stderr.take() {
            forward_lines(stderr, "ptp4l", Some(event_tx.clone()));
        }
        if let Some(child) = phc2sys.as_mut() {
            if let Some(stdout) = child.stdout.take() {
                forward_lines(stdout, "phc2sys", None);
            }
            if let Some(stderr) = child.stderr.take() {
                forward_lines(stderr, "phc2sys", None);
            }
        }

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Stopping PTP daemons");
                }
                status = ptp4l.wait() => {
                    warn!("ptp4l exited: {:?}", status);
                    let _ = event_tx.send(SyncEvent::DaemonExited).await;
                }
                status = wait_optional(&mut phc2sys) => {
                    warn!("phc2sys exited: {:?}", status);
                    let _ = event_tx.send(SyncEvent::DaemonExited).await;
                }
            }

            let _ = ptp4l.kill().await;
            if let Some(child) = phc2sys.as_mut() {
                let _ = child.kill().await;
            }
            info!("PTP daemons stopped");
        });

        Ok(DaemonHandle::new(event_rx, shutdown_tx, task))
    }
}
