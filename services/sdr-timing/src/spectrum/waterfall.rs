//! Fixed-capacity history of spectral rows for display
//!
//! The producer never blocks on a reader: `push` evicts the oldest row when
//! full, and `snapshot` only clones row pointers under the lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::pipeline::SpectralRow;

pub struct WaterfallBuffer {
    capacity: usize,
    rows: Mutex<VecDeque<Arc<SpectralRow>>>,
    total_pushed: AtomicU64,
    evicted: AtomicU64,
}

impl WaterfallBuffer {
    /// A capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            rows: Mutex::new(VecDeque::with_capacity(capacity)),
            total_pushed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<SpectralRow>>> {
        // Rows are inserted whole, so a poisoned buffer is still consistent
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, row: SpectralRow) {
        let row = Arc::new(row);
        let evicted = {
            let mut rows = self.lock();
            let evicted = if rows.len() == self.capacity {
                rows.pop_front().is_some()
            } else {
                false
            };
            rows.push_back(row);
            evicted
        };
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        if evicted {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<Arc<SpectralRow>> {
        self.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Arc<SpectralRow>> {
        self.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_pushed(&self) -> u64 {
        self.total_pushed.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdr::{HardwareTimestamp, SourceId};
    use std::thread;

    fn row(sequence: u64, n: usize) -> SpectralRow {
        SpectralRow {
            source: SourceId::new("w"),
            sequence,
            timestamp: HardwareTimestamp::from_nanos(sequence as i64 * 1000),
            center_freq: 100e6,
            bandwidth: 1e6,
            powers_db: vec![sequence as f32; n],
            averaged: 1,
            discontinuity: false,
        }
    }

    #[test]
    fn test_overflow_keeps_last_rows_in_order() {
        let waterfall = WaterfallBuffer::new(5);
        for seq in 0..12 {
            waterfall.push(row(seq, 4));
        }
        let snapshot = waterfall.snapshot();
        let seqs: Vec<u64> = snapshot.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![7, 8, 9, 10, 11]);
        assert_eq!(waterfall.len(), 5);
        assert_eq!(waterfall.total_pushed(), 12);
        assert_eq!(waterfall.evicted(), 7);
        assert_eq!(waterfall.latest().map(|r| r.sequence), Some(11));
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let waterfall = WaterfallBuffer::new(0);
        assert!(waterfall.is_empty());
        waterfall.push(row(1, 2));
        waterfall.push(row(2, 2));
        assert_eq!(waterfall.capacity(), 1);
        assert_eq!(waterfall.snapshot().len(), 1);
        assert_eq!(waterfall.latest().map(|r| r.sequence), Some(2));
    }

    #[test]
    fn test_snapshot_during_concurrent_pushes() {
        let waterfall = Arc::new(WaterfallBuffer::new(16));
        let writer = {
            let waterfall = waterfall.clone();
            thread::spawn(move || {
                for seq in 0..2000 {
                    waterfall.push(row(seq, 64));
                }
            })
        };

        for _ in 0..200 {
            let snapshot = waterfall.snapshot();
            assert!(snapshot.len() <= 16);
            for pair in snapshot.windows(2) {
                assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            }
            for r in &snapshot {
                assert_eq!(r.powers_db.len(), 64);
                assert!(r.powers_db.iter().all(|&p| p == r.sequence as f32));
            }
        }

        writer.join().unwrap();
        assert_eq!(waterfall.latest().map(|r| r.sequence), Some(1999));
    }
}
