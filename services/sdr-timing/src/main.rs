//! sdr-timing - SDR acquisition, live waterfall and PTP-gated delay measurement
//!
//! Opens every configured device, keeps a waterfall and a raw capture per
//! device, optionally runs a PTP clock session, and periodically measures the
//! delay between the first two devices. Each measurement is printed as one
//! JSON line on stdout.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sdr_timing::config::Config;
use sdr_timing::device::DeviceManager;
use sdr_timing::ptp::{ClockController, ProcessPrivilege};
use sdr_timing::tdoa::{CorrelationError, Correlator, CorrelatorConfig};
use sdr_timing::timing::ClockRegistry;

/// Span of raw samples correlated per measurement
const CORRELATION_WINDOW: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sdr_timing=info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("===========================================");
    info!("   SDR Timing");
    info!("   waterfall spectrum + PTP delay measurement");
    info!("===========================================");

    let config = Config::from_env();

    info!("Configuration:");
    info!("  Devices: {}", config.devices);
    info!("  Center frequency: {:.3} MHz", config.center_freq / 1e6);
    info!("  Sample rate: {:.3} MS/s", config.sample_rate / 1e6);
    match config.gain_db {
        Some(gain) => info!("  Gain: {:.1} dB", gain),
        None => info!("  Gain: auto"),
    }
    info!(
        "  FFT size: {} | Averaging: {} ({:?})",
        config.fft_size,
        config.averaging,
        config.averaging_mode()
    );
    info!("  Waterfall rows: {}", config.waterfall_rows);
    info!("  Capture buffer: {:.1} s", config.capture_secs);
    info!("  rtl_sdr path: {:?}", config.rtl_sdr_path);

    let device_args = config
        .device_args()
        .context("Invalid SDR_DEVICES")?;
    let settings = config.device_settings();

    let mut devices = DeviceManager::new();
    for args in &device_args {
        if let Err(e) = devices.open_device(args, &settings) {
            error!("{:#}", e);
        }
    }
    if devices.is_empty() {
        anyhow::bail!("No SDR device could be opened");
    }

    // Clock session shared by every device on this host
    let mut registry = ClockRegistry::new();
    let controller = match config.ptp_session() {
        Some((role, peer)) => {
            info!("  PTP: {} on {}", role, peer);
            let controller = ClockController::new(
                Arc::new(config.ptp_daemon()),
                Arc::new(ProcessPrivilege),
                config.controller_options(),
            );
            if let Err(e) = controller.start(role, peer).await {
                error!("Clock session failed to start: {}", e);
            }
            for device in devices.devices() {
                registry.register(device.id().clone(), controller.status_handle());
            }
            Some(controller)
        }
        None => {
            info!("  PTP: not configured (set PTP_ROLE and PTP_PEER)");
            None
        }
    };

    let correlate = config.correlate_interval_secs > 0 && devices.len() >= 2;
    if !correlate {
        info!("Delay measurement disabled (needs two devices and CORRELATE_INTERVAL_SECS > 0)");
    }
    let mut correlator = Correlator::new(CorrelatorConfig::default());

    info!("===========================================");
    info!("  Starting capture...");
    info!("  Press Ctrl+C to stop.");
    info!("===========================================");

    let mut stats_tick = tokio::time::interval(Duration::from_secs(config.stats_interval_secs.max(1)));
    let mut correlate_tick =
        tokio::time::interval(Duration::from_secs(config.correlate_interval_secs.max(1)));
    let mut measurements = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
            _ = stats_tick.tick() => {
                devices.log_stats();
                if let Some(controller) = &controller {
                    let status = controller.status();
                    info!(
                        "[Clock] {} | offset: {:?} ns | path delay: {:?} ns | age: {:?}",
                        status.state,
                        status.offset_ns,
                        status.path_delay_ns,
                        status.last_update_age
                    );
                }
                if devices.running_count() == 0 {
                    warn!("All devices stopped");
                    break;
                }
            }
            _ = correlate_tick.tick(), if correlate => {
                let reference = &devices.devices()[0];
                let target = &devices.devices()[1];
                let a = reference.capture().latest_contiguous(CORRELATION_WINDOW);
                let b = target.capture().latest_contiguous(CORRELATION_WINDOW);

                let result = tokio::task::block_in_place(|| correlator.estimate(&a, &b, &registry));
                match result {
                    Ok(estimate) => {
                        measurements += 1;
                        match serde_json::to_string(&estimate) {
                            Ok(line) => println!("{}", line),
                            Err(e) => warn!("Failed to serialize delay estimate: {}", e),
                        }
                    }
                    Err(CorrelationError::NotSynchronized(e)) => {
                        warn!("Delay measurement: not synchronized ({})", e);
                    }
                    Err(e) => warn!("Delay measurement failed: {}", e),
                }
            }
        }
    }

    // Cleanup
    if let Some(controller) = &controller {
        controller.stop().await;
    }
    tokio::task::spawn_blocking(move || devices.stop_all())
        .await
        .context("Device shutdown panicked")?;

    info!("Shutdown complete. Delay measurements: {}", measurements);
    Ok(())
}
