//! Duration-bounded history of raw sample blocks
//!
//! Keeps the most recent `max_duration` of one stream so a delay measurement
//! can pull a window by timestamp after the fact.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::sdr::{HardwareTimestamp, SampleBlock};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureInfo {
    pub entries: usize,
    pub total_samples: usize,
    /// Span between the oldest and newest block starts
    pub duration_secs: f64,
    pub oldest: Option<HardwareTimestamp>,
    pub newest: Option<HardwareTimestamp>,
}

#[derive(Default)]
struct Inner {
    blocks: VecDeque<Arc<SampleBlock>>,
    total_samples: usize,
}

pub struct TimedCapture {
    max_duration_ns: i64,
    inner: Mutex<Inner>,
}

impl TimedCapture {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            max_duration_ns: i64::try_from(max_duration.as_nanos()).unwrap_or(i64::MAX),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a block and drop everything older than the retention window
    /// measured from it
    pub fn add(&self, block: Arc<SampleBlock>) {
        let cutoff = block.timestamp().nanos().saturating_sub(self.max_duration_ns);
        let mut inner = self.lock();
        inner.total_samples += block.len();
        inner.blocks.push_back(block);

        while let Some(front) = inner.blocks.front() {
            if front.timestamp().nanos() >= cutoff {
                break;
            }
            let len = front.len();
            inner.blocks.pop_front();
            inner.total_samples -= len;
        }
    }

    /// Blocks whose first sample lies in `start..=end`, oldest first
    pub fn range(&self, start: HardwareTimestamp, end: HardwareTimestamp) -> Vec<Arc<SampleBlock>> {
        self.lock()
            .blocks
            .iter()
            .filter(|b| b.timestamp() >= start && b.timestamp() <= end)
            .cloned()
            .collect()
    }

    /// Newest gap-free run of blocks covering at least `duration`, or as
    /// much of it as exists since the last discontinuity
    pub fn latest_contiguous(&self, duration: Duration) -> Vec<Arc<SampleBlock>> {
        let want = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        let inner = self.lock();
        let mut run = Vec::new();
        let Some(end) = inner.blocks.back().map(|b| b.end_timestamp()) else {
            return run;
        };

        let mut later: Option<&Arc<SampleBlock>> = None;
        for block in inner.blocks.iter().rev() {
            if let Some(later) = later {
                if later.discontinuity() || later.sequence() != block.sequence().wrapping_add(1) {
                    break;
                }
            }
            run.push(block.clone());
            if end.nanos() - block.timestamp().nanos() >= want {
                break;
            }
            later = Some(block);
        }
        run.reverse();
        run
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.blocks.clear();
        inner.total_samples = 0;
    }

    pub fn info(&self) -> CaptureInfo {
        let inner = self.lock();
        let oldest = inner.blocks.front().map(|b| b.timestamp());
        let newest = inner.blocks.back().map(|b| b.timestamp());
        let duration_secs = match (oldest, newest) {
            (Some(o), Some(n)) if n > o => (n.nanos() - o.nanos()) as f64 / 1e9,
            _ => 0.0,
        };
        CaptureInfo {
            entries: inner.blocks.len(),
            total_samples: inner.total_samples,
            duration_secs,
            oldest,
            newest,
        }
    }
}
