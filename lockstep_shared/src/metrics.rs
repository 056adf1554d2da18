//! Transport metrics.
//!
//! Counters are bumped from both the receive task and the tick thread, so
//! they are atomics. Per-second rates are published by [`NetMetrics::roll`],
//! which the agent calls once per step.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct NetMetrics {
    window_start: Mutex<Instant>,

    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    messages: AtomicU64,

    bytes_up_per_sec: AtomicU64,
    bytes_down_per_sec: AtomicU64,
    messages_per_sec: AtomicU64,

    dropped_queue_full: AtomicU64,
    dropped_oversize: AtomicU64,
    dropped_invalid: AtomicU64,
    dropped_stale: AtomicU64,
}

/// Point-in-time copy of [`NetMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bytes_up_per_sec: u64,
    pub bytes_down_per_sec: u64,
    pub messages_per_sec: u64,
    pub dropped_queue_full: u64,
    pub dropped_oversize: u64,
    pub dropped_invalid: u64,
    pub dropped_stale: u64,
}

impl Default for NetMetrics {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl NetMetrics {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: Mutex::new(now),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            bytes_up_per_sec: AtomicU64::new(0),
            bytes_down_per_sec: AtomicU64::new(0),
            messages_per_sec: AtomicU64::new(0),
            dropped_queue_full: AtomicU64::new(0),
            dropped_oversize: AtomicU64::new(0),
            dropped_invalid: AtomicU64::new(0),
            dropped_stale: AtomicU64::new(0),
        }
    }

    pub fn record_upload(&self, bytes: usize) {
        self.bytes_up.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: usize) {
        self.bytes_down.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full(&self) {
        self.dropped_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oversize(&self) {
        self.dropped_oversize.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.dropped_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.dropped_stale.fetch_add(1, Ordering::Relaxed);
    }

    /// Publishes the per-second rates once a full second has passed.
    pub fn roll(&self, now: Instant) {
        let mut start = self
            .window_start
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if now.saturating_duration_since(*start) < Duration::from_secs(1) {
            return;
        }
        *start = now;

        self.bytes_up_per_sec
            .store(self.bytes_up.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.bytes_down_per_sec
            .store(self.bytes_down.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.messages_per_sec
            .store(self.messages.swap(0, Ordering::Relaxed), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_up_per_sec: self.bytes_up_per_sec.load(Ordering::Relaxed),
            bytes_down_per_sec: self.bytes_down_per_sec.load(Ordering::Relaxed),
            messages_per_sec: self.messages_per_sec.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            dropped_oversize: self.dropped_oversize.load(Ordering::Relaxed),
            dropped_invalid: self.dropped_invalid.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
        }
    }
}

/// Formats a byte count as B/KB/MB.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{bytes}B")
    } else if b < KB * KB {
        format!("{:.1}KB", b / KB)
    } else {
        format!("{:.1}MB", b / (KB * KB))
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "U:{}/s D:{}/s M:{}/s",
            format_bytes(self.bytes_up_per_sec),
            format_bytes(self.bytes_down_per_sec),
            self.messages_per_sec
        )
    }
}
