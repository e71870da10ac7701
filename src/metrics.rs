//! Counters for the latency-measurement path.
//!
//! Every fault in [`LatencyFault`](crate::error::LatencyFault) ends up here
//! instead of in an error return. Counters are relaxed atomics, cheap enough to
//! touch once per frame from any task.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::LatencyFault;

/// Aggregated latency-path counters for one role.
#[derive(Debug, Default)]
pub struct LatencyMetrics {
    frames_received: AtomicU64,
    tags_emitted: AtomicU64,
    samples_dropped: AtomicU64,
    records_received: AtomicU64,
    malformed_datagrams: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
    tag_absent: AtomicU64,
    decode_failures: AtomicU64,
    evicted: AtomicU64,
    session_resets: AtomicU64,
}

/// Point-in-time copy of [`LatencyMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub tags_emitted: u64,
    pub samples_dropped: u64,
    pub records_received: u64,
    pub malformed_datagrams: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub tag_absent: u64,
    pub decode_failures: u64,
    pub evicted: u64,
    pub session_resets: u64,
}

impl LatencyMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tag_emitted(&self) {
        self.tags_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// A timestamp record that never made it onto the side-channel.
    fn record_sample_dropped(&self) {
        self.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.records_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_match(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tag_absent(&self) {
        self.tag_absent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: u64) {
        if count > 0 {
            self.evicted.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_session_reset(&self) {
        self.session_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a fault under the matching counter.
    pub fn record_fault(&self, fault: LatencyFault) {
        match fault {
            LatencyFault::TagDecodeFailure => self.record_decode_failure(),
            LatencyFault::SideChannelUnavailable => self.record_sample_dropped(),
            LatencyFault::UnmatchedFrame => self.record_unmatched(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            tags_emitted: self.tags_emitted.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            malformed_datagrams: self.malformed_datagrams.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            tag_absent: self.tag_absent.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            session_resets: self.session_resets.load(Ordering::Relaxed),
        }
    }
}
