//! Configuration loaded from environment variables

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::device::{AcquisitionPolicy, DeviceSettings};
use crate::ptp::{ControllerOptions, PeerEndpoint, Ptp4lDaemon, Role, SessionConfig};
use crate::sdr::{ArgsError, DeviceArgs, OpenOptions, TuningParams};
use crate::spectrum::{AveragingMode, SpectrumConfig};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// `;`-separated device argument strings
    pub devices: String,

    /// Sample rate in S/s
    pub sample_rate: f64,

    /// Center frequency in Hz
    pub center_freq: f64,

    /// Tuner gain in dB, `None` for automatic gain
    pub gain_db: Option<f32>,

    /// Transform size (bins per row)
    pub fft_size: usize,

    /// Transforms averaged into one row
    pub averaging: usize,

    /// `block` or `exponential`
    pub averaging_mode: String,

    /// EMA weight of the newest transform
    pub averaging_alpha: f32,

    pub db_floor: f32,

    /// Rows kept for display
    pub waterfall_rows: usize,

    pub read_timeout_ms: u64,

    /// Consecutive read timeouts before a device counts as stalled
    pub read_retries: u32,

    pub block_queue_depth: usize,

    pub block_samples: usize,

    /// Path to the rtl_sdr executable
    pub rtl_sdr_path: PathBuf,

    /// Clock session role; no session when unset
    pub ptp_role: Option<Role>,

    /// `<interface>` or `<interface>@<address>`
    pub ptp_peer: Option<PeerEndpoint>,

    pub ptp4l_path: PathBuf,

    pub phc2sys_path: PathBuf,

    pub ptp_offset_limit_ns: i64,

    pub ptp_stable_samples: u32,

    pub ptp_staleness_ms: u64,

    pub ptp_poll_ms: u64,

    pub ptp_negotiation_timeout_secs: u64,

    /// Raw samples retained per device for delay measurement
    pub capture_secs: f64,

    /// 0 disables delay measurement
    pub correlate_interval_secs: u64,

    pub stats_interval_secs: u64,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value lookup. Malformed values fall back
    /// to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = &lookup;
        Self {
            devices: lookup("SDR_DEVICES").unwrap_or_else(|| "driver=rtlsdr,index=0".to_string()),

            sample_rate: parse_or(lookup, "SAMPLE_RATE", 2_048_000.0),

            center_freq: parse_or(lookup, "CENTER_FREQ", 100_000_000.0),

            // Unset, "auto" or unparsable means automatic gain
            gain_db: lookup("GAIN_DB").and_then(|s| s.trim().parse().ok()),

            fft_size: parse_or(lookup, "FFT_SIZE", 1024),

            averaging: parse_or(lookup, "AVERAGING", 4),

            averaging_mode: lookup("AVERAGING_MODE")
                .map(|s| s.trim().to_lowercase())
                .unwrap_or_else(|| "block".to_string()),

            averaging_alpha: parse_or(lookup, "AVERAGING_ALPHA", 0.3),

            db_floor: parse_or(lookup, "DB_FLOOR", -120.0),

            waterfall_rows: parse_or(lookup, "WATERFALL_ROWS", 256),

            read_timeout_ms: parse_or(lookup, "READ_TIMEOUT_MS", 500),

            read_retries: parse_or(lookup, "READ_RETRIES", 10),

            block_queue_depth: parse_or(lookup, "BLOCK_QUEUE_DEPTH", 64),

            block_samples: parse_or(lookup, "BLOCK_SAMPLES", 16_384),

            rtl_sdr_path: lookup("RTL_SDR_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rtl_sdr")),

            ptp_role: lookup("PTP_ROLE").and_then(|s| s.parse().ok()),

            ptp_peer: lookup("PTP_PEER").and_then(|s| s.parse().ok()),

            ptp4l_path: lookup("PTP4L_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ptp4l")),

            phc2sys_path: lookup("PHC2SYS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("phc2sys")),

            ptp_offset_limit_ns: parse_or(lookup, "PTP_OFFSET_LIMIT_NS", 1_000),

            ptp_stable_samples: parse_or(lookup, "PTP_STABLE_SAMPLES", 4),

            ptp_staleness_ms: parse_or(lookup, "PTP_STALENESS_MS", 5_000),

            ptp_poll_ms: parse_or(lookup, "PTP_POLL_MS", 1_000),

            ptp_negotiation_timeout_secs: parse_or(lookup, "PTP_NEGOTIATION_TIMEOUT_SECS", 30),

            capture_secs: parse_or(lookup, "CAPTURE_SECS", 10.0),

            correlate_interval_secs: parse_or(lookup, "CORRELATE_INTERVAL_SECS", 5),

            stats_interval_secs: parse_or(lookup, "STATS_INTERVAL_SECS", 10),
        }
    }

    pub fn device_args(&self) -> Result<Vec<DeviceArgs>, ArgsError> {
        DeviceArgs::parse_list(&self.devices)
    }

    pub fn tuning(&self) -> TuningParams {
        TuningParams {
            sample_rate: self.sample_rate,
            center_freq: self.center_freq,
            gain_db: self.gain_db,
        }
    }

    pub fn averaging_mode(&self) -> AveragingMode {
        match self.averaging_mode.as_str() {
            "exponential" | "ema" => AveragingMode::Exponential {
                alpha: self.averaging_alpha,
            },
            _ => AveragingMode::Block,
        }
    }

    pub fn spectrum_config(&self) -> SpectrumConfig {
        SpectrumConfig {
            fft_size: self.fft_size,
            averaging: self.averaging,
            mode: self.averaging_mode(),
            floor_db: self.db_floor,
            ..SpectrumConfig::default()
        }
    }

    pub fn acquisition_policy(&self) -> AcquisitionPolicy {
        AcquisitionPolicy {
            block_samples: self.block_samples.max(1),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            max_retries: self.read_retries,
            queue_depth: self.block_queue_depth.max(1),
        }
    }

    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            tuning: self.tuning(),
            open: OpenOptions {
                rtl_sdr_path: self.rtl_sdr_path.clone(),
                ..OpenOptions::default()
            },
            spectrum: self.spectrum_config(),
            acquisition: self.acquisition_policy(),
            waterfall_rows: self.waterfall_rows,
            capture_duration: Duration::from_secs_f64(self.capture_secs.max(0.0)),
        }
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            session: SessionConfig {
                offset_limit_ns: self.ptp_offset_limit_ns,
                stable_samples: self.ptp_stable_samples.max(1),
                staleness: Duration::from_millis(self.ptp_staleness_ms),
                negotiation_timeout: Duration::from_secs(self.ptp_negotiation_timeout_secs),
            },
            poll_interval: Duration::from_millis(self.ptp_poll_ms.max(10)),
            ..ControllerOptions::default()
        }
    }

    pub fn ptp_daemon(&self) -> Ptp4lDaemon {
        Ptp4lDaemon {
            ptp4l_path: self.ptp4l_path.clone(),
            phc2sys_path: self.phc2sys_path.clone(),
            ..Ptp4lDaemon::default()
        }
    }

    /// Role and peer when a clock session is configured
    pub fn ptp_session(&self) -> Option<(Role, PeerEndpoint)> {
        Some((self.ptp_role?, self.ptp_peer.clone()?))
    }
}
