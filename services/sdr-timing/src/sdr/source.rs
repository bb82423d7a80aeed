//! Sample source contract shared by all drivers

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::args::{ArgsError, DeviceArgs, Driver};
use super::block::{SampleBlock, SourceId};
use super::capture::RtlSdrSource;
use super::remote::RtlTcpSource;
use super::synthetic::SyntheticSource;

/// Tuning applied at open or by an explicit retune
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningParams {
    pub sample_rate: f64,
    pub center_freq: f64,
    /// Tuner gain in dB, `None` for automatic gain
    pub gain_db: Option<f32>,
}

/// Result of one bounded read
#[derive(Debug)]
pub enum ReadOutcome {
    Block(SampleBlock),
    /// Nothing arrived within the timeout
    Timeout,
    /// The device or its reader lost samples since the previous read
    Overflow { dropped_samples: u64 },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("device unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported {name} {value}: {reason}")]
    UnsupportedParameter {
        name: &'static str,
        value: f64,
        reason: String,
    },
    #[error("device disconnected: {0}")]
    Disconnected(String),
    #[error("device stalled after {0} consecutive timeouts")]
    Stalled(u32),
    #[error(transparent)]
    Args(#[from] ArgsError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Pull-based stream of timestamped sample blocks
///
/// `read_block` may block up to `timeout` and reports a timeout as
/// `ReadOutcome::Timeout`, never as an empty block. Tuning only changes through
/// `retune`.
pub trait SampleSource: Send {
    fn id(&self) -> &SourceId;

    fn tuning(&self) -> TuningParams;

    fn read_block(&mut self, max_samples: usize, timeout: Duration)
        -> Result<ReadOutcome, SourceError>;

    /// Move to a new center frequency. The next block is flagged discontinuous.
    fn retune(&mut self, center_freq: f64) -> Result<(), SourceError>;

    /// Release the device. Calling it again is harmless.
    fn close(&mut self);
}

/// Options that are not part of the device argument string
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub rtl_sdr_path: PathBuf,
    pub connect_timeout: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            rtl_sdr_path: PathBuf::from("rtl_sdr"),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Open the driver named by `args`
pub fn open(
    args: &DeviceArgs,
    tuning: TuningParams,
    options: &OpenOptions,
) -> Result<Box<dyn SampleSource>, SourceError> {
    match args.driver() {
        Driver::RtlSdr => Ok(Box::new(RtlSdrSource::open(args, tuning, &options.rtl_sdr_path)?)),
        Driver::RtlTcp => Ok(Box::new(RtlTcpSource::open(
            args,
            tuning,
            options.connect_timeout,
        )?)),
        Driver::Synthetic => Ok(Box::new(SyntheticSource::open(args, tuning)?)),
    }
}

/// Reject tuning an RTL2832U based receiver cannot honor
pub(crate) fn check_rtl_tuning(tuning: &TuningParams) -> Result<(), SourceError> {
    let rate = tuning.sample_rate;
    let rate_ok = (225_001.0..=300_000.0).contains(&rate) || (900_001.0..=3_200_000.0).contains(&rate);
    if !rate_ok {
        return Err(SourceError::UnsupportedParameter {
            name: "sample rate",
            value: rate,
            reason: "RTL2832U supports 225001-300000 or 900001-3200000 S/s".into(),
        });
    }
    if !(24e6..=1_766e6).contains(&tuning.center_freq) {
        return Err(SourceError::UnsupportedParameter {
            name: "center frequency",
            value: tuning.center_freq,
            reason: "outside 24-1766 MHz".into(),
        });
    }
    if let Some(gain) = tuning.gain_db {
        if !(0.0..=49.6).contains(&gain) {
            return Err(SourceError::UnsupportedParameter {
                name: "gain",
                value: gain as f64,
                reason: "outside 0-49.6 dB".into(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning(sample_rate: f64, center_freq: f64, gain_db: Option<f32>) -> TuningParams {
        TuningParams {
            sample_rate,
            center_freq,
            gain_db,
        }
    }

    #[test]
    fn test_rtl_tuning_ranges() {
        assert!(check_rtl_tuning(&tuning(2.048e6, 100e6, Some(20.0))).is_ok());
        assert!(check_rtl_tuning(&tuning(250e3, 1090e6, None)).is_ok());

        for bad in [
            tuning(500e3, 100e6, None),
            tuning(3.3e6, 100e6, None),
            tuning(2.048e6, 10e6, None),
            tuning(2.048e6, 2e9, None),
            tuning(2.048e6, 100e6, Some(60.0)),
        ] {
            assert!(matches!(
                check_rtl_tuning(&bad),
                Err(SourceError::UnsupportedParameter { .. })
            ));
        }
    }

    #[test]
    fn test_open_synthetic() {
        let args: DeviceArgs = "driver=synthetic,label=sim".parse().unwrap();
        let source = open(&args, tuning(1e6, 100e6, None), &OpenOptions::default()).unwrap();
        assert_eq!(source.id().as_str(), "sim");
        assert_eq!(source.tuning().sample_rate, 1e6);
    }
}
