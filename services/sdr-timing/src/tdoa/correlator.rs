//! Delay estimation between two synchronized sample streams
//!
//! The streams are cut to their common observation window by timestamp and
//! cross-correlated in the frequency domain (zero-padded, so the correlation is
//! linear). The |R| peak gives the integer lag, a parabola through the peak and
//! its neighbours gives the fractional part.

use chrono::{DateTime, Utc};
use num_complex::Complex32;
use rustfft::FftPlanner;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::signal::{normalize, remove_dc};
use crate::sdr::{HardwareTimestamp, SampleBlock, SourceId};
use crate::timing::{ensure_comparable, time_difference_ns, NotComparable, SyncQuery};

/// Peak-to-sidelobe ratios are capped here when no sidelobe exists
const MAX_PSR_DB: f32 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationMode {
    /// Correlate complex samples directly
    Complex,
    /// Correlate DC-removed magnitudes normalized to their peak
    Magnitude,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatorConfig {
    /// Shortest common window worth correlating
    pub min_samples: usize,
    /// Sidelobe/peak ratio at or above which the estimate is ambiguous
    pub ambiguity_ratio: f32,
    pub remove_dc: bool,
    pub mode: CorrelationMode,
    /// Longest window correlated; longer overlaps are truncated
    pub max_window_samples: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            min_samples: 64,
            ambiguity_ratio: 0.8,
            remove_dc: true,
            mode: CorrelationMode::Complex,
            max_window_samples: 1 << 20,
        }
    }
}

#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("not synchronized: {0}")]
    NotSynchronized(#[from] NotComparable),
    #[error("no samples to correlate")]
    NoSamples,
    #[error("sample rates differ: {a} vs {b} S/s")]
    SampleRateMismatch { a: f64, b: f64 },
    #[error("samples from {0} are not contiguous")]
    Discontinuous(SourceId),
    #[error("common window is {overlap} samples, need at least {required}")]
    InsufficientOverlap { overlap: usize, required: usize },
    #[error("no correlation peak (silent input)")]
    NoPeak,
}

/// Correlation peak in sample units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagEstimate {
    /// Positive when `b` lags `a`
    pub lag: f64,
    pub confidence: f32,
    pub peak_to_sidelobe_db: f32,
    pub ambiguous: bool,
}

/// Result of one correlation pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelayEstimate {
    pub reference: SourceId,
    pub target: SourceId,
    /// Delay of `target` relative to `reference`
    pub seconds: f64,
    pub samples: f64,
    /// 1 − sidelobe/peak, in [0, 1]
    pub confidence: f32,
    pub peak_to_sidelobe_db: f32,
    pub ambiguous: bool,
    pub window_samples: usize,
    pub created_at: DateTime<Utc>,
}

struct Window {
    source: SourceId,
    start: HardwareTimestamp,
    sample_rate: f64,
    samples: Vec<Complex32>,
}

impl Window {
    /// Join blocks that must follow each other without a gap
    fn from_blocks(blocks: &[Arc<SampleBlock>]) -> Result<Self, CorrelationError> {
        let first = blocks.first().ok_or(CorrelationError::NoSamples)?;
        let mut samples = Vec::with_capacity(blocks.iter().map(|b| b.len()).sum());
        samples.extend_from_slice(first.samples());

        for pair in blocks.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.discontinuity()
                || next.sequence() != prev.sequence().wrapping_add(1)
                || next.source() != first.source()
                || next.sample_rate() != first.sample_rate()
            {
                return Err(CorrelationError::Discontinuous(first.source().clone()));
            }
            samples.extend_from_slice(next.samples());
        }
        if samples.is_empty() {
            return Err(CorrelationError::NoSamples);
        }

        Ok(Self {
            source: first.source().clone(),
            start: first.timestamp(),
            sample_rate: first.sample_rate(),
            samples,
        })
    }

    fn end(&self) -> HardwareTimestamp {
        self.start.advanced_by(self.samples.len() as u64, self.sample_rate)
    }

    fn index_of(&self, at: HardwareTimestamp) -> usize {
        let ns = (at.nanos() - self.start.nanos()).max(0);
        (ns as f64 * self.sample_rate / 1e9).round() as usize
    }
}

/// Cross-correlation delay estimator. Keeps FFT plans between passes.
pub struct Correlator {
    config: CorrelatorConfig,
    planner: FftPlanner<f32>,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            planner: FftPlanner::new(),
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Delay of stream `b` relative to stream `a`
    ///
    /// Both sources' clocks must be synchronized; otherwise nothing is
    /// computed.
    pub fn estimate(
        &mut self,
        a: &[Arc<SampleBlock>],
        b: &[Arc<SampleBlock>],
        sync: &dyn SyncQuery,
    ) -> Result<DelayEstimate, CorrelationError> {
        let (a_first, b_first) = match (a.first(), b.first()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(CorrelationError::NoSamples),
        };
        ensure_comparable(a_first.source(), b_first.source(), sync)?;

        let (rate_a, rate_b) = (a_first.sample_rate(), b_first.sample_rate());
        if (rate_a - rate_b).abs() > rate_a.abs() * 1e-9 {
            return Err(CorrelationError::SampleRateMismatch {
                a: rate_a,
                b: rate_b,
            });
        }

        let wa = Window::from_blocks(a)?;
        let wb = Window::from_blocks(b)?;
        let fs = wa.sample_rate;

        // Common observation window
        let start = wa.start.max(wb.start);
        let end = wa.end().min(wb.end());
        let (ia, ib) = (wa.index_of(start), wb.index_of(start));
        let overlap = if end > start {
            (wa.samples.len().saturating_sub(ia))
                .min(wb.samples.len().saturating_sub(ib))
                .min(self.config.max_window_samples)
        } else {
            0
        };
        if overlap < self.config.min_samples.max(2) {
            return Err(CorrelationError::InsufficientOverlap {
                overlap,
                required: self.config.min_samples.max(2),
            });
        }

        let lag = self.estimate_lag(
            &wa.samples[ia..ia + overlap],
            &wb.samples[ib..ib + overlap],
        )?;

        // Residual offset between the two cut points (under a sample)
        let a_start = wa.start.advanced_by(ia as u64, fs);
        let b_start = wb.start.advanced_by(ib as u64, fs);
        let residual_ns = time_difference_ns(&wa.source, a_start, &wb.source, b_start, sync)?;

        let seconds = lag.lag / fs + residual_ns as f64 / 1e9;
        debug!(
            "Correlated {} vs {} over {} samples: lag {:.3} samples, residual {} ns, confidence {:.3}",
            wa.source, wb.source, overlap, lag.lag, residual_ns, lag.confidence
        );

        Ok(DelayEstimate {
            reference: wa.source,
            target: wb.source,
            seconds,
            samples: seconds * fs,
            confidence: lag.confidence,
            peak_to_sidelobe_db: lag.peak_to_sidelobe_db,
            ambiguous: lag.ambiguous,
            window_samples: overlap,
            created_at: Utc::now(),
        })
    }

    /// Lag of `b` relative to `a` in samples, from the correlation
    /// R[k] = Σ conj(a[n])·b[n + k]
    pub fn estimate_lag(
        &mut self,
        a: &[Complex32],
        b: &[Complex32],
    ) -> Result<LagEstimate, CorrelationError> {
        if a.is_empty() || b.is_empty() {
            return Err(CorrelationError::NoSamples);
        }

        let (mut xa, mut xb) = match self.config.mode {
            CorrelationMode::Complex => {
                let (mut xa, mut xb) = (a.to_vec(), b.to_vec());
                if self.config.remove_dc {
                    remove_dc(&mut xa);
                    remove_dc(&mut xb);
                }
                (xa, xb)
            }
            CorrelationMode::Magnitude => (as_complex(&normalize(a)), as_complex(&normalize(b))),
        };

        let (la, lb) = (xa.len(), xb.len());
        let nfft = (la + lb - 1).next_power_of_two();
        let forward = self.planner.plan_fft_forward(nfft);
        let inverse = self.planner.plan_fft_inverse(nfft);

        xa.resize(nfft, Complex32::default());
        xb.resize(nfft, Complex32::default());
        forward.process(&mut xa);
        forward.process(&mut xb);
        for (x, y) in xa.iter_mut().zip(&xb) {
            *x = x.conj() * y;
        }
        inverse.process(&mut xa);

        // Linear lags -(la-1)..=(lb-1); negative lags wrap to the end
        let min_lag = -(la as i64 - 1);
        let mags: Vec<f32> = (min_lag..lb as i64)
            .map(|lag| {
                let idx = if lag < 0 { nfft as i64 + lag } else { lag };
                xa[idx as usize].norm()
            })
            .collect();

        let (peak_idx, peak) = mags
            .iter()
            .copied()
            .enumerate()
            .max_by(|x, y| x.1.total_cmp(&y.1))
            .ok_or(CorrelationError::NoPeak)?;
        if !(peak > 0.0) {
            return Err(CorrelationError::NoPeak);
        }

        let frac = if peak_idx > 0 && peak_idx + 1 < mags.len() {
            parabolic_offset(mags[peak_idx - 1], peak, mags[peak_idx + 1])
        } else {
            0.0
        };

        let sidelobe = sidelobe_level(&mags, peak_idx);
        let ratio = sidelobe / peak;
        let peak_to_sidelobe_db = if sidelobe > 0.0 {
            (20.0 * (peak / sidelobe).log10()).min(MAX_PSR_DB)
        } else {
            MAX_PSR_DB
        };

        Ok(LagEstimate {
            lag: (min_lag + peak_idx as i64) as f64 + frac as f64,
            confidence: (1.0 - ratio).clamp(0.0, 1.0),
            peak_to_sidelobe_db,
            ambiguous: ratio >= self.config.ambiguity_ratio,
        })
    }
}

fn as_complex(values: &[f32]) -> Vec<Complex32> {
    values.iter().map(|&v| Complex32::new(v, 0.0)).collect()
}

/// Vertex of the parabola through three equally spaced points, relative to
/// the middle one
fn parabolic_offset(y0: f32, y1: f32, y2: f32) -> f32 {
    let den = y0 - 2.0 * y1 + y2;
    if den.abs() <= f32::EPSILON * y1.abs() {
        return 0.0;
    }
    (0.5 * (y0 - y2) / den).clamp(-0.5, 0.5)
}

/// Largest value outside the main lobe. The lobe always takes in the peak's
/// direct neighbours, which tie when the delay falls halfway between bins,
/// then runs down to the nearest rise on each side.
fn sidelobe_level(mags: &[f32], peak_idx: usize) -> f32 {
    let mut lo = peak_idx.saturating_sub(1);
    while lo > 0 && mags[lo - 1] <= mags[lo] {
        lo -= 1;
    }
    let mut hi = (peak_idx + 1).min(mags.len() - 1);
    while hi + 1 < mags.len() && mags[hi + 1] <= mags[hi] {
        hi += 1;
    }
    mags[..lo]
        .iter()
        .chain(&mags[hi + 1..])
        .copied()
        .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::ClockState;
    use std::collections::HashMap;

    /// Gaussian-enveloped carrier centered on `center`
    fn pulse(n: usize, center: f64) -> Vec<Complex32> {
        (0..n)
            .map(|k| {
                let t = k as f64 - center;
                let env = (-0.5 * (t / 8.0).powi(2)).exp();
                let phase = 0.5 * t;
                Complex32::new((env * phase.cos()) as f32, (env * phase.sin()) as f32)
            })
            .collect()
    }

    fn add(a: &[Complex32], b: &[Complex32]) -> Vec<Complex32> {
        a.iter().zip(b).map(|(x, y)| x + y).collect()
    }

    #[test]
    fn test_fractional_delay_recovered() {
        let mut correlator = Correlator::new(CorrelatorConfig::default());
        for delay in [12.3, -7.65, 0.0, 3.5] {
            let a = pulse(256, 100.0);
            let b = pulse(256, 100.0 + delay);
            let est = correlator.estimate_lag(&a, &b).unwrap();
            assert!(
                (est.lag - delay).abs() < 0.05,
                "delay {} estimated as {}",
                delay,
                est.lag
            );
            assert!(est.confidence > 0.9);
            assert!(!est.ambiguous);
        }
    }

    #[test]
    fn test_half_sample_delay_is_confident() {
        let mut correlator = Correlator::new(CorrelatorConfig::default());
        for delay in [3.5, -0.5, 20.5] {
            let a = pulse(256, 100.0);
            let b = pulse(256, 100.0 + delay);
            let est = correlator.estimate_lag(&a, &b).unwrap();
            assert!((est.lag - delay).abs() < 0.05, "delay {} estimated as {}", delay, est.lag);
            assert!(est.confidence > 0.9, "delay {} confidence {}", delay, est.confidence);
            assert!(est.peak_to_sidelobe_db > 20.0);
            assert!(!est.ambiguous);
        }
    }

    #[test]
    fn test_sidelobe_level_skips_tied_neighbour() {
        let mags = [0.1, 0.3, 1.0, 1.0, 0.2, 0.05, 0.4, 0.1];
        assert_eq!(sidelobe_level(&mags, 2), 0.4);
        assert_eq!(sidelobe_level(&mags, 3), 0.4);
        assert_eq!(sidelobe_level(&[1.0], 0), 0.0);
    }

    #[test]
    fn test_magnitude_mode() {
        let mut correlator = Correlator::new(CorrelatorConfig {
            mode: CorrelationMode::Magnitude,
            ..CorrelatorConfig::default()
        });
        let a = pulse(256, 100.0);
        let b = pulse(256, 130.0);
        let est = correlator.estimate_lag(&a, &b).unwrap();
        assert!((est.lag - 30.0).abs() < 0.5);
    }

    #[test]
    fn test_equal_peaks_are_ambiguous() {
        let mut correlator = Correlator::new(CorrelatorConfig::default());
        let a = pulse(256, 60.0);
        let b = add(&pulse(256, 80.0), &pulse(256, 180.0));
        let est = correlator.estimate_lag(&a, &b).unwrap();
        assert!(est.ambiguous);
        assert!(est.confidence < 0.2);
        assert!(est.peak_to_sidelobe_db < 1.0);
    }

    #[test]
    fn test_silent_input_has_no_peak() {
        let mut correlator = Correlator::new(CorrelatorConfig::default());
        let silent = vec![Complex32::default(); 64];
        assert!(matches!(
            correlator.estimate_lag(&silent, &silent),
            Err(CorrelationError::NoPeak)
        ));
    }

    #[test]
    fn test_parabolic_offset() {
        assert_eq!(parabolic_offset(1.0, 2.0, 1.0), 0.0);
        assert!(parabolic_offset(1.5, 2.0, 1.0) < 0.0);
        assert_eq!(parabolic_offset(2.0, 2.0, 2.0), 0.0);
    }

    fn blocks(source: &str, start_ns: i64, samples: Vec<Complex32>, per_block: usize) -> Vec<Arc<SampleBlock>> {
        let fs = 1e6;
        samples
            .chunks(per_block)
            .enumerate()
            .map(|(i, chunk)| {
                Arc::new(SampleBlock::new(
                    SourceId::new(source),
                    fs,
                    100e6,
                    i as u64,
                    HardwareTimestamp::from_nanos(start_ns).advanced_by((i * per_block) as u64, fs),
                    chunk.to_vec(),
                ))
            })
            .collect()
    }

    fn states(a: ClockState, b: ClockState) -> HashMap<SourceId, ClockState> {
        let mut states = HashMap::new();
        states.insert(SourceId::new("a"), a);
        states.insert(SourceId::new("b"), b);
        states
    }

    #[test]
    fn test_delay_between_time_aligned_streams() {
        // b starts 3 µs later; the pulse reaches b 12.3 µs after a
        let t0 = 1_700_000_000_000_000_000;
        let a = blocks("a", t0, pulse(1024, 500.0), 256);
        let b = blocks("b", t0 + 3_000, pulse(1024, 500.0 + 12.3 - 3.0), 256);

        let mut correlator = Correlator::new(CorrelatorConfig::default());
        let sync = states(ClockState::Synchronized, ClockState::Synchronized);
        let est = correlator.estimate(&a, &b, &sync).unwrap();

        assert!((est.seconds - 12.3e-6).abs() < 0.05e-6, "got {}", est.seconds);
        assert!((est.samples - 12.3).abs() < 0.05);
        assert_eq!(est.window_samples, 1021);
        assert_eq!(est.reference, SourceId::new("a"));
        assert!(!est.ambiguous);
    }

    #[test]
    fn test_degraded_session_is_precondition_failure() {
        let a = blocks("a", 0, pulse(512, 200.0), 256);
        let b = blocks("b", 0, pulse(512, 210.0), 256);
        let mut correlator = Correlator::new(CorrelatorConfig::default());

        let sync = states(ClockState::Synchronized, ClockState::Degraded);
        match correlator.estimate(&a, &b, &sync) {
            Err(CorrelationError::NotSynchronized(err)) => {
                assert_eq!(err.stream, SourceId::new("b"));
                assert_eq!(err.state, ClockState::Degraded);
            }
            other => panic!("expected precondition failure, got {:?}", other),
        }
    }

    #[test]
    fn test_window_errors() {
        let mut correlator = Correlator::new(CorrelatorConfig::default());
        let sync = states(ClockState::Synchronized, ClockState::Synchronized);

        // No overlap in time
        let a = blocks("a", 0, pulse(256, 100.0), 256);
        let b = blocks("b", 1_000_000, pulse(256, 100.0), 256);
        assert!(matches!(
            correlator.estimate(&a, &b, &sync),
            Err(CorrelationError::InsufficientOverlap { overlap: 0, .. })
        ));

        // Gap inside a stream
        let mut gapped = blocks("a", 0, pulse(512, 100.0), 256);
        gapped[1] = Arc::new((*gapped[1]).clone().with_discontinuity(true));
        let b = blocks("b", 0, pulse(512, 100.0), 256);
        assert!(matches!(
            correlator.estimate(&gapped, &b, &sync),
            Err(CorrelationError::Discontinuous(_))
        ));

        assert!(matches!(
            correlator.estimate(&[], &b, &sync),
            Err(CorrelationError::NoSamples)
        ));
    }
}
