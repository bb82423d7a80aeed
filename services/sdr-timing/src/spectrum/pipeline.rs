//! Sample blocks → averaged power spectra in dB
//!
//! Each frame of `fft_size` samples is Hann windowed, transformed and converted
//! to power normalized by the window's coherent gain, so a full-scale complex
//! tone on a bin center reads 0 dB. Frames are collected across blocks; a block
//! shorter than the transform is never padded.

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::Serialize;
use std::f32::consts::PI;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::sdr::{HardwareTimestamp, SampleBlock, SourceId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AveragingMode {
    /// Mean of each group of K transforms
    Block,
    /// Running exponential average, sampled every K transforms
    Exponential { alpha: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumConfig {
    pub fft_size: usize,
    /// Transforms per emitted row (K)
    pub averaging: usize,
    pub mode: AveragingMode,
    /// Linear power that reads as 0 dB
    pub reference: f32,
    pub floor_db: f32,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            fft_size: 1024,
            averaging: 1,
            mode: AveragingMode::Block,
            reference: 1.0,
            floor_db: -120.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpectrumError {
    #[error("transform size must be at least 2, got {0}")]
    InvalidFftSize(usize),
    #[error("averaging factor must be at least 1")]
    InvalidAveraging,
    #[error("exponential averaging alpha must be in (0, 1], got {0}")]
    InvalidAlpha(f32),
    #[error("reference power must be positive, got {0}")]
    InvalidReference(f32),
}

impl SpectrumConfig {
    pub fn validate(&self) -> Result<(), SpectrumError> {
        if self.fft_size < 2 {
            return Err(SpectrumError::InvalidFftSize(self.fft_size));
        }
        if self.averaging == 0 {
            return Err(SpectrumError::InvalidAveraging);
        }
        if let AveragingMode::Exponential { alpha } = self.mode {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(SpectrumError::InvalidAlpha(alpha));
            }
        }
        if !(self.reference > 0.0) {
            return Err(SpectrumError::InvalidReference(self.reference));
        }
        Ok(())
    }
}

/// One display row: power in dB, lowest frequency first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectralRow {
    pub source: SourceId,
    /// Sequence number of the block holding the row's first sample
    pub sequence: u64,
    /// Timestamp of the row's first sample
    pub timestamp: HardwareTimestamp,
    pub center_freq: f64,
    /// Displayed span in Hz (the sample rate)
    pub bandwidth: f64,
    pub powers_db: Vec<f32>,
    /// Number of transforms averaged into this row
    pub averaged: usize,
    /// Samples were lost or tuning changed before this row
    pub discontinuity: bool,
}

impl SpectralRow {
    pub fn len(&self) -> usize {
        self.powers_db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.powers_db.is_empty()
    }

    /// Center frequency of bin `index` in Hz
    pub fn bin_frequency(&self, index: usize) -> f64 {
        let n = self.powers_db.len();
        if n == 0 {
            return self.center_freq;
        }
        let offset = index as f64 - (n / 2) as f64;
        self.center_freq + offset * self.bandwidth / n as f64
    }

    pub fn frequency_axis(&self) -> Vec<f64> {
        (0..self.powers_db.len()).map(|i| self.bin_frequency(i)).collect()
    }

    /// Index and level of the strongest bin
    pub fn peak(&self) -> Option<(usize, f32)> {
        self.powers_db
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

#[derive(Debug, Clone, Copy)]
struct Origin {
    sequence: u64,
    timestamp: HardwareTimestamp,
}

#[derive(Debug, Clone, Copy)]
struct StreamPosition {
    sequence: u64,
    sample_rate: f64,
    center_freq: f64,
}

/// Streaming spectrum estimator for one source
pub struct SpectrumPipeline {
    config: SpectrumConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// (Σw)², the power of a full-scale tone after windowing
    window_power: f32,
    frame: Vec<Complex32>,
    fill: usize,
    frame_origin: Option<Origin>,
    row_origin: Option<Origin>,
    work: Vec<Complex32>,
    scratch: Vec<Complex32>,
    accum: Vec<f32>,
    ema_seeded: bool,
    transforms: usize,
    last: Option<StreamPosition>,
    mark_next: bool,
    rows_emitted: u64,
}

impl SpectrumPipeline {
    pub fn new(config: SpectrumConfig) -> Result<Self, SpectrumError> {
        config.validate()?;
        let n = config.fft_size;

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n);
        let scratch = vec![Complex32::default(); fft.get_inplace_scratch_len()];

        // Periodic Hann
        let window: Vec<f32> = (0..n)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / n as f32).cos())
            .collect();
        let gain: f32 = window.iter().sum();

        Ok(Self {
            window,
            window_power: gain * gain,
            frame: vec![Complex32::default(); n],
            fill: 0,
            frame_origin: None,
            row_origin: None,
            work: vec![Complex32::default(); n],
            scratch,
            accum: vec![0.0; n],
            ema_seeded: false,
            transforms: 0,
            last: None,
            mark_next: false,
            rows_emitted: 0,
            fft,
            config,
        })
    }

    pub fn config(&self) -> &SpectrumConfig {
        &self.config
    }

    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted
    }

    /// Samples held toward the next transform
    pub fn pending_samples(&self) -> usize {
        self.fill
    }

    /// Feed one block, returning every row it completes
    pub fn push(&mut self, block: &SampleBlock) -> Vec<SpectralRow> {
        if self.breaks_continuity(block) {
            if self.fill > 0 || self.transforms > 0 {
                debug!(
                    "[{}] discontinuity at seq {}: dropping {} pending samples, {} partial transforms",
                    block.source(),
                    block.sequence(),
                    self.fill,
                    self.transforms
                );
            }
            self.reset();
            self.mark_next = true;
        }
        self.last = Some(StreamPosition {
            sequence: block.sequence(),
            sample_rate: block.sample_rate(),
            center_freq: block.center_freq(),
        });

        let n = self.config.fft_size;
        let samples = block.samples();
        let mut rows = Vec::new();
        let mut offset = 0;

        while offset < samples.len() {
            if self.fill == 0 {
                self.frame_origin = Some(Origin {
                    sequence: block.sequence(),
                    timestamp: block.timestamp().advanced_by(offset as u64, block.sample_rate()),
                });
            }
            let take = (n - self.fill).min(samples.len() - offset);
            self.frame[self.fill..self.fill + take].copy_from_slice(&samples[offset..offset + take]);
            self.fill += take;
            offset += take;

            if self.fill == n {
                self.fill = 0;
                if let Some(row) = self.transform_frame(block) {
                    rows.push(row);
                }
            }
        }

        rows
    }

    /// Drop partial frames and averages
    pub fn reset(&mut self) {
        self.fill = 0;
        self.frame_origin = None;
        self.row_origin = None;
        self.transforms = 0;
        self.ema_seeded = false;
        self.accum.iter_mut().for_each(|p| *p = 0.0);
    }

    fn breaks_continuity(&self, block: &SampleBlock) -> bool {
        if block.discontinuity() {
            return true;
        }
        match self.last {
            None => false,
            Some(last) => {
                block.sequence() != last.sequence.wrapping_add(1)
                    || block.sample_rate() != last.sample_rate
                    || block.center_freq() != last.center_freq
            }
        }
    }

    fn transform_frame(&mut self, block: &SampleBlock) -> Option<SpectralRow> {
        for ((out, x), w) in self.work.iter_mut().zip(&self.frame).zip(&self.window) {
            *out = *x * *w;
        }
        self.fft.process_with_scratch(&mut self.work, &mut self.scratch);

        if self.transforms == 0 {
            self.row_origin = self.frame_origin;
        }

        let norm = self.window_power;
        match self.config.mode {
            AveragingMode::Block => {
                for (acc, x) in self.accum.iter_mut().zip(&self.work) {
                    *acc += x.norm_sqr() / norm;
                }
            }
            AveragingMode::Exponential { alpha } => {
                // The running average persists across rows until a reset
                let seeded = self.ema_seeded;
                for (acc, x) in self.accum.iter_mut().zip(&self.work) {
                    let p = x.norm_sqr() / norm;
                    *acc = if seeded { *acc + alpha * (p - *acc) } else { p };
                }
                self.ema_seeded = true;
            }
        }
        self.transforms += 1;

        if self.transforms < self.config.averaging {
            return None;
        }

        let k = self.transforms;
        self.transforms = 0;
        let mut powers_db: Vec<f32> = match self.config.mode {
            AveragingMode::Block => {
                let row = self.accum.iter().map(|p| self.to_db(p / k as f32)).collect();
                self.accum.iter_mut().for_each(|p| *p = 0.0);
                row
            }
            AveragingMode::Exponential { .. } => self.accum.iter().map(|p| self.to_db(*p)).collect(),
        };
        // Negative frequencies first
        let half = (powers_db.len() + 1) / 2;
        powers_db.rotate_left(half);

        let origin = self.row_origin.take().unwrap_or(Origin {
            sequence: block.sequence(),
            timestamp: block.timestamp(),
        });
        self.rows_emitted += 1;

        Some(SpectralRow {
            source: block.source().clone(),
            sequence: origin.sequence,
            timestamp: origin.timestamp,
            center_freq: block.center_freq(),
            bandwidth: block.sample_rate(),
            powers_db,
            averaged: k,
            discontinuity: std::mem::take(&mut self.mark_next),
        })
    }

    fn to_db(&self, power: f32) -> f32 {
        let db = 10.0 * (power / self.config.reference).log10();
        if db.is_nan() {
            self.config.floor_db
        } else {
            db.max(self.config.floor_db)
        }
    }
}
