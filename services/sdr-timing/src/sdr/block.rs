//! Sample blocks and the timestamps that tag them
//!
//! A `SampleBlock` is produced once by a source adapter and is immutable after
//! that. Timestamps live in the clock domain of the host that produced them and
//! only become comparable across hosts once both clock sessions are
//! synchronized (see `crate::timing`).

use num_complex::Complex32;
use serde::Serialize;
use std::fmt;

/// Identifier of one sample source (one device stream)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Nanosecond timestamp of the first sample of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct HardwareTimestamp {
    nanos: i64,
}

impl HardwareTimestamp {
    pub const fn from_nanos(nanos: i64) -> Self {
        Self { nanos }
    }

    /// Current host realtime clock. Under PTP this clock is disciplined by phc2sys.
    pub fn host_now() -> Self {
        Self::from_nanos(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0))
    }

    pub fn nanos(self) -> i64 {
        self.nanos
    }

    pub fn as_secs_f64(self) -> f64 {
        self.nanos as f64 / 1e9
    }

    /// Timestamp of the sample `samples` positions after this one
    pub fn advanced_by(self, samples: u64, sample_rate: f64) -> Self {
        Self::from_nanos(self.nanos + samples_to_nanos(samples as f64, sample_rate))
    }

    /// Timestamp of the sample `samples` positions before this one
    pub fn rewound_by(self, samples: u64, sample_rate: f64) -> Self {
        Self::from_nanos(self.nanos - samples_to_nanos(samples as f64, sample_rate))
    }
}

fn samples_to_nanos(samples: f64, sample_rate: f64) -> i64 {
    if sample_rate <= 0.0 {
        return 0;
    }
    (samples * 1e9 / sample_rate).round() as i64
}

/// A contiguous run of complex samples from one source
#[derive(Debug, Clone)]
pub struct SampleBlock {
    source: SourceId,
    sample_rate: f64,
    center_freq: f64,
    sequence: u64,
    timestamp: HardwareTimestamp,
    discontinuity: bool,
    samples: Vec<Complex32>,
}

impl SampleBlock {
    pub fn new(
        source: SourceId,
        sample_rate: f64,
        center_freq: f64,
        sequence: u64,
        timestamp: HardwareTimestamp,
        samples: Vec<Complex32>,
    ) -> Self {
        Self {
            source,
            sample_rate,
            center_freq,
            sequence,
            timestamp,
            discontinuity: false,
            samples,
        }
    }

    /// Mark that samples were lost between the previous block and this one
    pub fn with_discontinuity(mut self, discontinuity: bool) -> Self {
        self.discontinuity = discontinuity;
        self
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn center_freq(&self) -> f64 {
        self.center_freq
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> HardwareTimestamp {
        self.timestamp
    }

    pub fn discontinuity(&self) -> bool {
        self.discontinuity
    }

    pub fn samples(&self) -> &[Complex32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Timestamp one sample period past the last sample
    pub fn end_timestamp(&self) -> HardwareTimestamp {
        self.timestamp.advanced_by(self.samples.len() as u64, self.sample_rate)
    }
}

/// Assigns sequence numbers and sample-clock timestamps to blocks of one stream
///
/// The clock is anchored on the host clock when the first data arrives and then
/// advances purely by sample count. Losing samples breaks the count, so sources
/// call `reanchor` after every overflow.
#[derive(Debug)]
pub(crate) struct SampleClock {
    sample_rate: f64,
    anchor: Option<HardwareTimestamp>,
    samples_since_anchor: u64,
    next_sequence: u64,
}

impl SampleClock {
    pub(crate) fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            anchor: None,
            samples_since_anchor: 0,
            next_sequence: 0,
        }
    }

    pub(crate) fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }

    /// Anchor so that `buffered` samples ended at `arrival`
    pub(crate) fn anchor_at(&mut self, arrival: HardwareTimestamp, buffered: u64) {
        if self.anchor.is_none() {
            self.anchor = Some(arrival.rewound_by(buffered, self.sample_rate));
            self.samples_since_anchor = 0;
        }
    }

    pub(crate) fn reanchor(&mut self) {
        self.anchor = None;
        self.samples_since_anchor = 0;
    }

    /// Sequence number and first-sample timestamp for the next `len` samples
    pub(crate) fn stamp(&mut self, len: usize) -> (u64, HardwareTimestamp) {
        let anchor = *self.anchor.get_or_insert_with(HardwareTimestamp::host_now);
        let timestamp = anchor.advanced_by(self.samples_since_anchor, self.sample_rate);
        let sequence = self.next_sequence;
        self.samples_since_anchor += len as u64;
        self.next_sequence += 1;
        (sequence, timestamp)
    }
}
