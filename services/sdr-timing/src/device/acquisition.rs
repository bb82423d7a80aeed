//! Acquisition worker - one dedicated thread per source
//!
//! The worker is the only caller of `read_block` and the only writer into the
//! device's bounded block queue. It never waits on the consumer: a full queue
//! drops the block and flags the next one as discontinuous.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::state::DeviceStats;
use crate::sdr::{ReadOutcome, SampleBlock, SampleSource, SourceError, SourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionPolicy {
    /// Samples requested per read
    pub block_samples: usize,
    pub read_timeout: Duration,
    /// Consecutive timeouts tolerated before the source counts as stalled
    pub max_retries: u32,
    pub queue_depth: usize,
}

impl Default for AcquisitionPolicy {
    fn default() -> Self {
        Self {
            block_samples: 16_384,
            read_timeout: Duration::from_millis(500),
            max_retries: 10,
            queue_depth: 64,
        }
    }
}

#[derive(Debug)]
pub enum AcquisitionEvent {
    Block(SampleBlock),
    /// Acquisition stopped on this error; nothing follows it
    Fault(SourceError),
}

pub struct Acquisition {
    id: SourceId,
    running: Arc<AtomicBool>,
    stats: Arc<DeviceStats>,
    handle: Option<JoinHandle<()>>,
}

impl Acquisition {
    /// Start reading `source` on a dedicated thread
    pub fn start(
        source: Box<dyn SampleSource>,
        policy: AcquisitionPolicy,
        stats: Arc<DeviceStats>,
    ) -> Result<(Self, Receiver<AcquisitionEvent>)> {
        let id = source.id().clone();
        let (tx, rx) = bounded::<AcquisitionEvent>(policy.queue_depth.max(1));
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = running.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name(format!("acquire-{}", id))
                .spawn(move || run_acquisition(source, policy, running, stats, tx))
                .with_context(|| format!("Failed to spawn acquisition thread for {}", id))?
        };

        Ok((
            Self {
                id,
                running,
                stats,
                handle: Some(handle),
            },
            rx,
        ))
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &Arc<DeviceStats> {
        &self.stats
    }

    /// Ask the worker to stop and wait for it. Returns within about one read
    /// timeout.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Acquisition thread for {} panicked", self.id);
            }
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_acquisition(
    mut source: Box<dyn SampleSource>,
    policy: AcquisitionPolicy,
    running: Arc<AtomicBool>,
    stats: Arc<DeviceStats>,
    tx: Sender<AcquisitionEvent>,
) {
    let id = source.id().clone();
    info!("[{}] Acquisition started ({} samples per block)", id, policy.block_samples);

    let mut consecutive_timeouts = 0u32;
    let mut gap = false;
    let mut fault = None;

    while running.load(Ordering::SeqCst) {
        match source.read_block(policy.block_samples, policy.read_timeout) {
            Ok(ReadOutcome::Block(block)) => {
                consecutive_timeouts = 0;
                stats.record_block(block.len());
                let flagged = gap || block.discontinuity();
                match tx.try_send(AcquisitionEvent::Block(block.with_discontinuity(flagged))) {
                    Ok(()) => gap = false,
                    Err(TrySendError::Full(_)) => {
                        stats.record_queue_drop();
                        if !gap {
                            warn!("[{}] Block queue full, dropping blocks", id);
                        }
                        gap = true;
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        debug!("[{}] Block queue closed", id);
                        break;
                    }
                }
            }
            Ok(ReadOutcome::Timeout) => {
                consecutive_timeouts += 1;
                stats.record_timeout();
                if consecutive_timeouts > policy.max_retries {
                    fault = Some(SourceError::Stalled(consecutive_timeouts));
                    break;
                }
                debug!(
                    "[{}] Read timeout ({}/{})",
                    id, consecutive_timeouts, policy.max_retries
                );
            }
            Ok(ReadOutcome::Overflow { dropped_samples }) => {
                stats.record_overflow(dropped_samples);
                warn!("[{}] Overflow: {} samples lost", id, dropped_samples);
                gap = true;
            }
            Err(e) => {
                fault = Some(e);
                break;
            }
        }
    }

    source.close();
    running.store(false, Ordering::SeqCst);

    if let Some(e) = fault {
        error!("[{}] Acquisition stopped: {}", id, e);
        stats.record_fault();
        if tx
            .send_timeout(AcquisitionEvent::Fault(e), Duration::from_secs(1))
            .is_err()
        {
            debug!("[{}] Fault not delivered, consumer gone", id);
        }
    }

    info!("[{}] Acquisition stopped. {}", id, stats);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdr::synthetic::SyntheticSource;
    use crate::sdr::{DeviceArgs, TuningParams};

    fn synthetic(args: &str, sample_rate: f64) -> Box<dyn SampleSource> {
        let args: DeviceArgs = args.parse().unwrap();
        let tuning = TuningParams {
            sample_rate,
            center_freq: 100e6,
            gain_db: None,
        };
        Box::new(SyntheticSource::open(&args, tuning).unwrap())
    }

    fn policy(block_samples: usize, queue_depth: usize) -> AcquisitionPolicy {
        AcquisitionPolicy {
            block_samples,
            read_timeout: Duration::from_millis(10),
            max_retries: 3,
            queue_depth,
        }
    }

    #[test]
    fn test_blocks_arrive_in_order() {
        let source = synthetic("driver=synthetic,pace=false,epoch_ns=0", 1e6);
        let (mut acq, rx) =
            Acquisition::start(source, policy(256, 1024), Arc::new(DeviceStats::new())).unwrap();

        let mut sequences = Vec::new();
        while sequences.len() < 20 {
            match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                AcquisitionEvent::Block(block) => sequences.push(block.sequence()),
                AcquisitionEvent::Fault(e) => panic!("unexpected fault: {}", e),
            }
        }
        acq.stop();
        assert!(!acq.is_running());
        assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_full_queue_drops_and_flags() {
        let source = synthetic("driver=synthetic,pace=false", 1e6);
        let stats = Arc::new(DeviceStats::new());
        let (mut acq, rx) = Acquisition::start(source, policy(64, 2), stats.clone()).unwrap();

        // Let the worker overrun the queue before draining it
        thread::sleep(Duration::from_millis(100));
        assert!(stats.get_queue_drops() > 0);

        let mut previous: Option<SampleBlock> = None;
        let flagged = loop {
            let AcquisitionEvent::Block(block) = rx.recv_timeout(Duration::from_secs(2)).unwrap()
            else {
                panic!("unexpected fault");
            };
            if block.discontinuity() {
                break (previous.map(|b| b.sequence()), block.sequence());
            }
            previous = Some(block);
        };
        // The oldest queued block went in before any drop
        let (before, after) = flagged;
        let before = before.expect("first block is never flagged");
        assert!(after > before + 1);
        acq.stop();
    }

    #[test]
    fn test_overflow_flags_next_block() {
        let source = synthetic("driver=synthetic,pace=false,overflow_every=3", 1e6);
        let stats = Arc::new(DeviceStats::new());
        let (mut acq, rx) = Acquisition::start(source, policy(128, 1024), stats.clone()).unwrap();

        let mut blocks = Vec::new();
        while blocks.len() < 4 {
            if let AcquisitionEvent::Block(block) = rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                blocks.push(block);
            }
        }
        acq.stop();

        // Reads 1, 2 are blocks, read 3 overflows, read 4 is flagged
        assert!(!blocks[1].discontinuity());
        assert!(blocks[2].discontinuity());
        assert!(stats.get_overflows() >= 1);
        assert_eq!(stats.get_samples_lost() % 128, 0);
    }

    #[test]
    fn test_repeated_timeouts_escalate_to_stalled() {
        // One block would take far longer than the read timeout to generate
        let source = synthetic("driver=synthetic", 1_000.0);
        let stats = Arc::new(DeviceStats::new());
        let (mut acq, rx) = Acquisition::start(source, policy(1_000_000, 4), stats.clone()).unwrap();

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            AcquisitionEvent::Fault(SourceError::Stalled(n)) => assert_eq!(n, 4),
            other => panic!("expected stall, got {:?}", other),
        }
        acq.stop();
        assert!(stats.is_faulted());
        assert_eq!(stats.get_timeouts(), 4);
    }
}
