//! RTL-SDR capture via the rtl_sdr process
//!
//! Spawns `rtl_sdr` writing raw 8-bit IQ to stdout. A reader thread forwards
//! stdout chunks through a bounded channel; a second thread forwards stderr to
//! the log and watches for lost-sample reports.
//!
//! Chunks the reader cannot queue are dropped and reported in stream order by a
//! `Gap` marker, so `read_block` still hands out the data queued before the
//! drop as contiguous blocks. Byte offsets are tracked across drops to keep
//! I/Q pairing intact.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::args::DeviceArgs;
use super::block::{HardwareTimestamp, SampleBlock, SampleClock, SourceId};
use super::demod::IqTable;
use super::source::{check_rtl_tuning, ReadOutcome, SampleSource, SourceError, TuningParams};

/// Bytes per stdout read (16K samples)
const CHUNK_BYTES: usize = 16 * 1024 * 2;

/// Chunks buffered between the reader thread and `read_block`
const CHUNK_QUEUE_DEPTH: usize = 64;

enum Chunk {
    Data {
        bytes: Vec<u8>,
        arrival: HardwareTimestamp,
    },
    /// Bytes the reader dropped since the previous chunk
    Gap {
        dropped_bytes: u64,
    },
    Eof,
}

/// rtl_sdr stderr lines that mean samples were dropped
fn reports_sample_loss(line: &str) -> bool {
    let line = line.to_ascii_lowercase();
    line.contains("samples lost") || line.contains("lost at least")
}

/// Local RTL-SDR driven through `rtl_sdr`
pub struct RtlSdrSource {
    id: SourceId,
    tuning: TuningParams,
    device_index: u32,
    ppm_error: i32,
    rtl_sdr_path: PathBuf,
    child: Option<Child>,
    chunks: Option<Receiver<Chunk>>,
    /// Set by the stderr thread when rtl_sdr reports lost samples
    device_lost: Arc<AtomicBool>,
    table: IqTable,
    /// Unconsumed bytes, always starting on an I byte
    pending: Vec<u8>,
    /// Stream offset of the next byte to arrive, counting dropped bytes
    stream_bytes: u64,
    /// Gap reached in the channel, reported once `pending` is used up
    gap: Option<u64>,
    last_arrival: Option<HardwareTimestamp>,
    clock: SampleClock,
    discontinuity: bool,
}

impl RtlSdrSource {
    pub fn open(
        args: &DeviceArgs,
        tuning: TuningParams,
        rtl_sdr_path: &Path,
    ) -> Result<Self, SourceError> {
        let mut source = Self::new(args, tuning, rtl_sdr_path)?;
        source.spawn()?;
        Ok(source)
    }

    fn new(
        args: &DeviceArgs,
        tuning: TuningParams,
        rtl_sdr_path: &Path,
    ) -> Result<Self, SourceError> {
        check_rtl_tuning(&tuning)?;

        Ok(Self {
            id: args.source_id(),
            tuning,
            device_index: args.parse_param("index")?.unwrap_or(0),
            ppm_error: args.parse_param("ppm")?.unwrap_or(0),
            rtl_sdr_path: rtl_sdr_path.to_path_buf(),
            child: None,
            chunks: None,
            device_lost: Arc::new(AtomicBool::new(false)),
            table: IqTable::new(),
            pending: Vec::with_capacity(CHUNK_BYTES * 2),
            stream_bytes: 0,
            gap: None,
            last_arrival: None,
            clock: SampleClock::new(tuning.sample_rate),
            discontinuity: false,
        })
    }

    fn spawn(&mut self) -> Result<(), SourceError> {
        // rtl_sdr -d <device> -f <freq> -s <rate> [-g <gain>] [-p <ppm>] -
        let mut cmd = Command::new(&self.rtl_sdr_path);
        cmd.arg("-d").arg(self.device_index.to_string())
           .arg("-f").arg(format!("{:.0}", self.tuning.center_freq))
           .arg("-s").arg(format!("{:.0}", self.tuning.sample_rate));

        if let Some(gain) = self.tuning.gain_db {
            cmd.arg("-g").arg(gain.to_string());
        }
        if self.ppm_error != 0 {
            cmd.arg("-p").arg(self.ppm_error.to_string());
        }

        cmd.arg("-")
           .stdin(Stdio::null())
           .stdout(Stdio::piped())
           .stderr(Stdio::piped());

        info!("[{}] Executing: {:?}", self.id, cmd);

        let mut child = cmd.spawn().map_err(|e| {
            SourceError::Unavailable(format!(
                "failed to spawn {}: {} (is rtl-sdr installed and in PATH?)",
                self.rtl_sdr_path.display(),
                e
            ))
        })?;

        let stdout = match child.stdout.take() {
            Some(s) => s,
            None => {
                let _ = child.kill();
                return Err(SourceError::Unavailable("rtl_sdr stdout not captured".into()));
            }
        };

        let (chunk_tx, chunk_rx) = bounded::<Chunk>(CHUNK_QUEUE_DEPTH);

        let name = format!("rtl-read-{}", self.device_index);
        thread::Builder::new()
            .name(name)
            .spawn(move || read_stdout(stdout, chunk_tx))?;

        if let Some(stderr) = child.stderr.take() {
            let device_lost = self.device_lost.clone();
            let id = self.id.clone();
            thread::Builder::new()
                .name(format!("rtl-log-{}", self.device_index))
                .spawn(move || {
                    let reader = BufReader::new(stderr);
                    for line in reader.lines().map_while(Result::ok) {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if reports_sample_loss(line) {
                            warn!("[rtl_sdr {}] {}", id, line);
                            device_lost.store(true, Ordering::Release);
                        } else {
                            info!("[rtl_sdr {}] {}", id, line);
                        }
                    }
                })?;
        }

        self.child = Some(child);
        self.chunks = Some(chunk_rx);
        self.stream_bytes = 0;
        self.gap = None;
        Ok(())
    }

    fn shutdown_process(&mut self) {
        self.chunks = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            debug!("[{}] rtl_sdr process stopped", self.id);
        }
    }

    /// Discard buffered bytes and start a new timestamp segment. The byte
    /// offset is kept so the next chunk can be realigned.
    fn reset_stream(&mut self) {
        self.pending.clear();
        self.last_arrival = None;
        self.clock.reanchor();
        self.discontinuity = true;
    }

    fn append(&mut self, bytes: &[u8], arrival: HardwareTimestamp) {
        // An empty buffer after a reset may sit on a Q byte
        let misaligned = self.pending.is_empty() && self.stream_bytes % 2 == 1;
        let skip = usize::from(misaligned).min(bytes.len());
        self.stream_bytes += bytes.len() as u64;
        self.pending.extend_from_slice(&bytes[skip..]);
        self.last_arrival = Some(arrival);
    }

    fn receive(&mut self, chunk: Chunk) -> bool {
        match chunk {
            Chunk::Data { bytes, arrival } => self.append(&bytes, arrival),
            Chunk::Gap { dropped_bytes } => self.gap = Some(dropped_bytes),
            Chunk::Eof => return false,
        }
        true
    }

    fn skip_gap(&mut self, dropped_bytes: u64) -> ReadOutcome {
        let discarded = self.pending.len() as u64 + dropped_bytes;
        self.stream_bytes += dropped_bytes;
        self.reset_stream();
        ReadOutcome::Overflow {
            dropped_samples: (discarded + 1) / 2,
        }
    }
}

/// Reader thread body: forward stdout chunks until EOF or the receiver goes
/// away. Chunks that do not fit are counted and reported by a `Gap` ahead of
/// the next chunk that does.
fn read_stdout(mut stdout: impl Read, chunk_tx: Sender<Chunk>) {
    let mut buffer = vec![0u8; CHUNK_BYTES];
    let mut dropped_bytes = 0u64;
    loop {
        match stdout.read(&mut buffer) {
            Ok(0) => break,
            Ok(n_read) => {
                if dropped_bytes > 0 {
                    match chunk_tx.try_send(Chunk::Gap { dropped_bytes }) {
                        Ok(()) => dropped_bytes = 0,
                        Err(TrySendError::Full(_)) => {
                            dropped_bytes += n_read as u64;
                            continue;
                        }
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
                let chunk = Chunk::Data {
                    bytes: buffer[..n_read].to_vec(),
                    arrival: HardwareTimestamp::host_now(),
                };
                match chunk_tx.try_send(chunk) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        if dropped_bytes == 0 {
                            debug!("rtl_sdr chunk queue full, dropping");
                        }
                        dropped_bytes += n_read as u64;
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Error reading from rtl_sdr: {}", e);
                break;
            }
        }
    }

    let timeout = Duration::from_secs(1);
    if dropped_bytes > 0
        && chunk_tx
            .send_timeout(Chunk::Gap { dropped_bytes }, timeout)
            .is_err()
    {
        return;
    }
    let _ = chunk_tx.send_timeout(Chunk::Eof, timeout);
}

impl SampleSource for RtlSdrSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn tuning(&self) -> TuningParams {
        self.tuning
    }

    fn read_block(
        &mut self,
        max_samples: usize,
        timeout: Duration,
    ) -> Result<ReadOutcome, SourceError> {
        // rtl_sdr does not say where in the stream its loss happened
        if self.device_lost.swap(false, Ordering::AcqRel) {
            let dropped_bytes = self.gap.take().unwrap_or(0);
            return Ok(self.skip_gap(dropped_bytes));
        }

        let max_samples = max_samples.max(1);
        let chunks = match &self.chunks {
            Some(chunks) => chunks.clone(),
            None => return Err(SourceError::Disconnected(format!("{} is closed", self.id))),
        };

        // Nothing after a gap is read until the data before it is handed out
        if self.gap.is_none() {
            if self.pending.len() < 2 {
                let ended = match chunks.recv_timeout(timeout) {
                    Ok(chunk) => !self.receive(chunk),
                    Err(RecvTimeoutError::Disconnected) => true,
                    Err(RecvTimeoutError::Timeout) => return Ok(ReadOutcome::Timeout),
                };
                if ended {
                    return Err(SourceError::Disconnected(format!(
                        "rtl_sdr output ended for {}",
                        self.id
                    )));
                }
            }

            while self.gap.is_none() && self.pending.len() < max_samples * 2 {
                match chunks.try_recv() {
                    Ok(chunk) => {
                        if !self.receive(chunk) {
                            break;
                        }
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
        }

        if self.pending.len() < 2 {
            return Ok(match self.gap.take() {
                Some(dropped_bytes) => self.skip_gap(dropped_bytes),
                None => ReadOutcome::Timeout,
            });
        }

        if !self.clock.is_anchored() {
            if let Some(arrival) = self.last_arrival {
                self.clock.anchor_at(arrival, (self.pending.len() / 2) as u64);
            }
        }

        let count = max_samples.min(self.pending.len() / 2);
        let mut samples = Vec::with_capacity(count);
        self.table.extend_samples(&self.pending[..count * 2], &mut samples);
        self.pending.drain(..count * 2);

        let (sequence, timestamp) = self.clock.stamp(count);
        let block = SampleBlock::new(
            self.id.clone(),
            self.tuning.sample_rate,
            self.tuning.center_freq,
            sequence,
            timestamp,
            samples,
        )
        .with_discontinuity(std::mem::take(&mut self.discontinuity));

        Ok(ReadOutcome::Block(block))
    }

    fn retune(&mut self, center_freq: f64) -> Result<(), SourceError> {
        let tuning = TuningParams {
            center_freq,
            ..self.tuning
        };
        check_rtl_tuning(&tuning)?;

        info!("[{}] Retuning to {:.3} MHz", self.id, center_freq / 1e6);
        self.shutdown_process();
        self.tuning = tuning;
        self.device_lost.store(false, Ordering::Release);
        self.reset_stream();
        self.spawn()
    }

    fn close(&mut self) {
        self.shutdown_process();
    }
}

impl Drop for RtlSdrSource {
    fn drop(&mut self) {
        self.close();
    }
}
