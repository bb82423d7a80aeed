//! Per-device state tracking

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Statistics for a single device (shared by acquisition and consumer threads)
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub blocks_read: AtomicU64,
    pub samples_read: AtomicU64,
    pub timeouts: AtomicU64,
    pub overflows: AtomicU64,
    pub samples_lost: AtomicU64,
    pub queue_drops: AtomicU64,
    pub rows_emitted: AtomicU64,
    pub faulted: AtomicBool,
}

impl DeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_block(&self, samples: usize) {
        self.blocks_read.fetch_add(1, Ordering::Relaxed);
        self.samples_read.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self, dropped_samples: u64) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
        self.samples_lost.fetch_add(dropped_samples, Ordering::Relaxed);
    }

    pub fn record_queue_drop(&self) {
        self.queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rows(&self, rows: usize) {
        self.rows_emitted.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.faulted.store(true, Ordering::Relaxed);
    }

    pub fn get_blocks(&self) -> u64 {
        self.blocks_read.load(Ordering::Relaxed)
    }

    pub fn get_samples(&self) -> u64 {
        self.samples_read.load(Ordering::Relaxed)
    }

    pub fn get_timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn get_overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    pub fn get_samples_lost(&self) -> u64 {
        self.samples_lost.load(Ordering::Relaxed)
    }

    pub fn get_queue_drops(&self) -> u64 {
        self.queue_drops.load(Ordering::Relaxed)
    }

    pub fn get_rows(&self) -> u64 {
        self.rows_emitted.load(Ordering::Relaxed)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Relaxed)
    }
}

impl fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Blocks: {} | Samples: {} | Rows: {} | Timeouts: {} | Overflows: {} (lost {}) | Queue drops: {}{}",
            self.get_blocks(),
            self.get_samples(),
            self.get_rows(),
            self.get_timeouts(),
            self.get_overflows(),
            self.get_samples_lost(),
            self.get_queue_drops(),
            if self.is_faulted() { " | FAULTED" } else { "" }
        )
    }
}
