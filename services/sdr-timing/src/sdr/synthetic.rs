//! Synthetic sample source
//!
//! Generates tones, uniform noise and an optional periodic band-limited pulse.
//! Useful for dry runs without hardware and for exercising the pipeline in
//! tests. Parameters:
//!
//! - `seed=N` noise seed
//! - `tones=offset_hz:dbfs|offset_hz:dbfs`
//! - `noise_db=-60` total noise power in dBFS
//! - `pulse=period_samples`, `pulse_offset=samples` (fractional allowed),
//!   `pulse_width=samples`, `pulse_db=dbfs`
//! - `pace=false` to generate as fast as the reader pulls
//! - `overflow_every=N` to report an overflow every N reads
//! - `epoch_ns=N` to pin the timestamp of sample 0

use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::thread;
use std::time::{Duration, Instant};

use super::args::{ArgsError, DeviceArgs};
use super::block::{HardwareTimestamp, SampleBlock, SourceId};
use super::source::{ReadOutcome, SampleSource, SourceError, TuningParams};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Tone {
    offset_hz: f64,
    amplitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pulse {
    period: u64,
    offset: f64,
    width: f64,
    amplitude: f64,
}

impl Pulse {
    /// Sinc lobes beyond this many widths are ignored
    const SPAN_WIDTHS: f64 = 16.0;

    fn value(&self, n: u64) -> f64 {
        let half_span = Self::SPAN_WIDTHS * self.width;
        let pos = n as f64 - self.offset;
        let k = (pos / self.period as f64).round();
        let mut acc = 0.0;
        for dk in [-1.0, 0.0, 1.0] {
            let t = (pos - (k + dk) * self.period as f64) / self.width;
            if (t * self.width).abs() <= half_span {
                acc += sinc(t);
            }
        }
        acc * self.amplitude
    }
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

fn db_to_amplitude(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

fn parse_tones(spec: &str) -> Result<Vec<Tone>, ArgsError> {
    spec.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|tone| {
            let invalid = || ArgsError::InvalidValue {
                key: "tones".into(),
                value: tone.to_string(),
            };
            let (freq, level) = tone.split_once(':').unwrap_or((tone, "0"));
            Ok(Tone {
                offset_hz: freq.trim().parse().map_err(|_| invalid())?,
                amplitude: db_to_amplitude(level.trim().parse().map_err(|_| invalid())?),
            })
        })
        .collect()
}

/// Deterministic generator implementing the source contract
pub struct SyntheticSource {
    id: SourceId,
    tuning: TuningParams,
    tones: Vec<Tone>,
    pulse: Option<Pulse>,
    noise_amplitude: f64,
    rng: StdRng,
    pace: bool,
    overflow_every: Option<u64>,
    epoch: HardwareTimestamp,
    started: Instant,
    next_sample: u64,
    next_sequence: u64,
    reads: u64,
    discontinuity: bool,
    closed: bool,
}

impl SyntheticSource {
    pub fn open(args: &DeviceArgs, tuning: TuningParams) -> Result<Self, SourceError> {
        if !(tuning.sample_rate > 0.0) {
            return Err(SourceError::UnsupportedParameter {
                name: "sample rate",
                value: tuning.sample_rate,
                reason: "must be positive".into(),
            });
        }

        let tones = match args.get("tones") {
            Some(spec) => parse_tones(spec)?,
            None => Vec::new(),
        };

        let pulse = match args.parse_param::<u64>("pulse")? {
            Some(0) => {
                return Err(ArgsError::InvalidValue {
                    key: "pulse".into(),
                    value: "0".into(),
                }
                .into())
            }
            Some(period) => Some(Pulse {
                period,
                offset: args.parse_param("pulse_offset")?.unwrap_or(0.0),
                width: args.parse_param::<f64>("pulse_width")?.unwrap_or(4.0).max(0.5),
                amplitude: db_to_amplitude(args.parse_param("pulse_db")?.unwrap_or(-6.0)),
            }),
            None => None,
        };

        // Uniform per component: total power 2a²/3
        let noise_power = 10f64.powf(args.parse_param("noise_db")?.unwrap_or(-60.0) / 10.0);

        let epoch = match args.parse_param::<i64>("epoch_ns")? {
            Some(ns) => HardwareTimestamp::from_nanos(ns),
            None => HardwareTimestamp::host_now(),
        };

        Ok(Self {
            id: args.source_id(),
            tuning,
            tones,
            pulse,
            noise_amplitude: (1.5 * noise_power).sqrt(),
            rng: StdRng::seed_from_u64(args.parse_param("seed")?.unwrap_or(0)),
            pace: args.parse_param("pace")?.unwrap_or(true),
            overflow_every: args.parse_param::<u64>("overflow_every")?.filter(|n| *n > 0),
            epoch,
            started: Instant::now(),
            next_sample: 0,
            next_sequence: 0,
            reads: 0,
            discontinuity: false,
            closed: false,
        })
    }

    fn generate(&mut self, count: usize) -> Vec<Complex32> {
        let fs = self.tuning.sample_rate;
        let first = self.next_sample;
        (0..count as u64)
            .map(|i| {
                let n = first + i;
                let mut re = 0.0;
                let mut im = 0.0;
                for tone in &self.tones {
                    let phase = 2.0 * PI * tone.offset_hz * n as f64 / fs;
                    re += tone.amplitude * phase.cos();
                    im += tone.amplitude * phase.sin();
                }
                if let Some(pulse) = &self.pulse {
                    re += pulse.value(n);
                }
                if self.noise_amplitude > 0.0 {
                    re += self.rng.gen_range(-self.noise_amplitude..self.noise_amplitude);
                    im += self.rng.gen_range(-self.noise_amplitude..self.noise_amplitude);
                }
                Complex32::new(re as f32, im as f32)
            })
            .collect()
    }
}

impl SampleSource for SyntheticSource {
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
        if self.closed {
            return Err(SourceError::Disconnected(format!("{} is closed", self.id)));
        }
        let count = max_samples.max(1);

        if self.pace {
            let due = Duration::from_secs_f64(
                (self.next_sample + count as u64) as f64 / self.tuning.sample_rate,
            );
            let elapsed = self.started.elapsed();
            if due > elapsed {
                let wait = due - elapsed;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Ok(ReadOutcome::Timeout);
                }
                thread::sleep(wait);
            }
        }

        self.reads += 1;
        if let Some(every) = self.overflow_every {
            if self.reads % every == 0 {
                self.next_sample += count as u64;
                self.discontinuity = true;
                return Ok(ReadOutcome::Overflow {
                    dropped_samples: count as u64,
                });
            }
        }

        let timestamp = self.epoch.advanced_by(self.next_sample, self.tuning.sample_rate);
        let samples = self.generate(count);
        self.next_sample += count as u64;

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        Ok(ReadOutcome::Block(
            SampleBlock::new(
                self.id.clone(),
                self.tuning.sample_rate,
                self.tuning.center_freq,
                sequence,
                timestamp,
                samples,
            )
            .with_discontinuity(std::mem::take(&mut self.discontinuity)),
        ))
    }

    fn retune(&mut self, center_freq: f64) -> Result<(), SourceError> {
        self.tuning.center_freq = center_freq;
        self.discontinuity = true;
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
