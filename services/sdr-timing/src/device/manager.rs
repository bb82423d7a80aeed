//! Device manager - wires each source to its spectrum pipeline, waterfall
//! and timed capture
//!
//! Per device there are two threads: the acquisition worker reading the
//! source, and a consumer that turns blocks into waterfall rows and keeps the
//! raw blocks for delay measurement. A device that faults stops on its own;
//! the others keep running and its waterfall keeps the last rows.

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

use super::acquisition::{Acquisition, AcquisitionEvent, AcquisitionPolicy};
use super::state::DeviceStats;
use crate::sdr::{self, DeviceArgs, OpenOptions, SourceId, TuningParams};
use crate::spectrum::{SpectrumConfig, SpectrumPipeline, WaterfallBuffer};
use crate::timed_capture::TimedCapture;

/// Everything needed to bring up one device, apart from its address
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub tuning: TuningParams,
    pub open: OpenOptions,
    pub spectrum: SpectrumConfig,
    pub acquisition: AcquisitionPolicy,
    pub waterfall_rows: usize,
    pub capture_duration: Duration,
}

/// One running device
pub struct DeviceHandle {
    id: SourceId,
    tuning: TuningParams,
    acquisition: Acquisition,
    consumer: Option<JoinHandle<()>>,
    waterfall: Arc<WaterfallBuffer>,
    capture: Arc<TimedCapture>,
    stats: Arc<DeviceStats>,
}

impl DeviceHandle {
    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn tuning(&self) -> TuningParams {
        self.tuning
    }

    pub fn is_running(&self) -> bool {
        self.acquisition.is_running()
    }

    pub fn waterfall(&self) -> &Arc<WaterfallBuffer> {
        &self.waterfall
    }

    pub fn capture(&self) -> &Arc<TimedCapture> {
        &self.capture
    }

    pub fn stats(&self) -> &Arc<DeviceStats> {
        &self.stats
    }

    fn stop(&mut self) {
        self.acquisition.stop();
        // The consumer ends once the acquisition side of the queue is gone
        if let Some(consumer) = self.consumer.take() {
            if consumer.join().is_err() {
                error!("Spectrum thread for {} panicked", self.id);
            }
        }
    }
}

#[derive(Default)]
pub struct DeviceManager {
    devices: Vec<DeviceHandle>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a device and start its acquisition and spectrum threads
    pub fn open_device(&mut self, args: &DeviceArgs, settings: &DeviceSettings) -> Result<SourceId> {
        let id = args.source_id();
        if self.get(&id).is_some() {
            anyhow::bail!("Device {} is already open", id);
        }

        let pipeline = SpectrumPipeline::new(settings.spectrum.clone())
            .context("Invalid spectrum configuration")?;
        let source = sdr::open(args, settings.tuning, &settings.open)
            .with_context(|| format!("Failed to open device {}", args))?;
        let id = source.id().clone();

        info!(
            "[{}] Opened {} at {:.3} MHz, {:.3} MS/s, gain {}",
            id,
            args.driver(),
            settings.tuning.center_freq / 1e6,
            settings.tuning.sample_rate / 1e6,
            settings
                .tuning
                .gain_db
                .map_or_else(|| "auto".to_string(), |g| format!("{:.1} dB", g))
        );

        let stats = Arc::new(DeviceStats::new());
        let (acquisition, blocks) = Acquisition::start(source, settings.acquisition, stats.clone())?;

        let waterfall = Arc::new(WaterfallBuffer::new(settings.waterfall_rows));
        let capture = Arc::new(TimedCapture::new(settings.capture_duration));

        let consumer = {
            let thread_id = id.clone();
            let waterfall = waterfall.clone();
            let capture = capture.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name(format!("spectrum-{}", id))
                .spawn(move || run_spectrum(thread_id, pipeline, blocks, waterfall, capture, stats))
                .with_context(|| format!("Failed to spawn spectrum thread for {}", id))?
        };

        self.devices.push(DeviceHandle {
            id: id.clone(),
            tuning: settings.tuning,
            acquisition,
            consumer: Some(consumer),
            waterfall,
            capture,
            stats,
        });
        Ok(id)
    }

    pub fn devices(&self) -> &[DeviceHandle] {
        &self.devices
    }

    pub fn get(&self, id: &SourceId) -> Option<&DeviceHandle> {
        self.devices.iter().find(|d| &d.id == id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.devices.iter().filter(|d| d.is_running()).count()
    }

    /// One `[Stats]` line per device
    pub fn log_stats(&self) {
        for device in &self.devices {
            info!(
                "[Stats] {} | {} | Waterfall: {}/{} | Capture: {:.2}s",
                device.id,
                device.stats,
                device.waterfall.len(),
                device.waterfall.capacity(),
                device.capture.info().duration_secs
            );
        }
    }

    pub fn stop_all(&mut self) {
        for device in &mut self.devices {
            info!("[{}] Stopping", device.id);
            device.stop();
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn run_spectrum(
    id: SourceId,
    mut pipeline: SpectrumPipeline,
    blocks: Receiver<AcquisitionEvent>,
    waterfall: Arc<WaterfallBuffer>,
    capture: Arc<TimedCapture>,
    stats: Arc<DeviceStats>,
) {
    loop {
        match blocks.recv_timeout(Duration::from_millis(500)) {
            Ok(AcquisitionEvent::Block(block)) => {
                let block = Arc::new(block);
                capture.add(block.clone());
                let rows = pipeline.push(&block);
                stats.record_rows(rows.len());
                for row in rows {
                    if row.discontinuity {
                        debug!("[{}] Row {} follows a discontinuity", id, row.sequence);
                    }
                    waterfall.push(row);
                }
            }
            Ok(AcquisitionEvent::Fault(e)) => {
                error!(
                    "[{}] Device fault: {} (keeping last {} waterfall rows)",
                    id,
                    e,
                    waterfall.len()
                );
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("[{}] Spectrum thread stopped after {} rows", id, pipeline.rows_emitted());
}
