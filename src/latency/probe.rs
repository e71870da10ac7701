//! Receiver-side latency probe.
//!
//! Every frame goes `RECEIVED -> DECODE_ATTEMPTED -> MATCHED | UNMATCHED`.
//! Only `MATCHED` produces a [`LatencySample`]; `UNMATCHED` is a normal
//! outcome, never an error.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use super::barcode::{DecodeOutcome, TagDecoder};
use super::correlation::CorrelationTable;
use super::reporter::LatencyReporter;
use super::{unix_now_secs, LatencySample, TimestampRecord};
use crate::config::{CorrelationMode, LatencyParams};
use crate::error::LatencyFault;
use crate::metrics::LatencyMetrics;
use crate::side_channel::{ingest, SharedTable};
use crate::video::RawFrame;

/// Why a frame produced no sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmatchedReason {
    /// No tag in the frame
    TagAbsent,
    /// A tag was there but could not be read
    DecodeFailed,
    /// The tag was read but no record was pending (lost, late or evicted)
    NoRecord,
}

/// Terminal state of one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    Matched(LatencySample),
    Unmatched(UnmatchedReason),
}

impl FrameOutcome {
    pub fn sample(&self) -> Option<&LatencySample> {
        match self {
            FrameOutcome::Matched(sample) => Some(sample),
            FrameOutcome::Unmatched(_) => None,
        }
    }
}

pub struct LatencyProbe {
    decoder: TagDecoder,
    table: SharedTable,
    reporter: LatencyReporter,
    metrics: Arc<LatencyMetrics>,
    mode: CorrelationMode,
}

impl LatencyProbe {
    pub fn new(params: &LatencyParams, framerate: u32, metrics: Arc<LatencyMetrics>) -> Self {
        let table = CorrelationTable::for_framerate(framerate, params.retention());
        Self {
            decoder: TagDecoder::new(params.cell_size, metrics.clone()),
            table: Arc::new(Mutex::new(table)),
            reporter: LatencyReporter::new(params.window),
            metrics,
            mode: params.correlation,
        }
    }

    /// Table to hand to the side-channel subscriber.
    pub fn table(&self) -> SharedTable {
        self.table.clone()
    }

    pub fn reporter(&self) -> &LatencyReporter {
        &self.reporter
    }

    pub fn reporter_mut(&mut self) -> &mut LatencyReporter {
        &mut self.reporter
    }

    pub fn metrics(&self) -> &Arc<LatencyMetrics> {
        &self.metrics
    }

    /// Feed a timestamp record directly, bypassing the socket.
    pub fn ingest(&self, record: TimestampRecord) {
        ingest(&self.table, record, &self.metrics);
    }

    pub fn on_frame(&mut self, frame: &RawFrame) -> FrameOutcome {
        self.on_frame_at(frame, Instant::now(), unix_now_secs())
    }

    /// Run one frame through decode and correlation. `now` drives eviction,
    /// `receive_time` (UNIX seconds) is what the sample is measured against.
    pub fn on_frame_at(&mut self, frame: &RawFrame, now: Instant, receive_time: f64) -> FrameOutcome {
        self.metrics.record_frame();

        let decoded = self.decoder.decode(frame);
        let (record, evicted, reason) = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            match decoded {
                DecodeOutcome::Tag(id) => {
                    let (record, evicted) = table.match_id_at(id, now);
                    (record, evicted, UnmatchedReason::NoRecord)
                }
                // Only untagged frames pair by arrival order
                DecodeOutcome::Absent => match self.mode {
                    CorrelationMode::ArrivalOrder => {
                        let (record, evicted) = table.take_oldest_at(now);
                        (record, evicted, UnmatchedReason::TagAbsent)
                    }
                    CorrelationMode::Barcode => {
                        (None, table.evict_expired(now), UnmatchedReason::TagAbsent)
                    }
                },
                DecodeOutcome::Corrupt => {
                    (None, table.evict_expired(now), UnmatchedReason::DecodeFailed)
                }
            }
        };
        self.metrics.record_evicted(evicted as u64);

        match record {
            Some(record) => {
                let sample = LatencySample::new(&record, receive_time);
                self.metrics.record_match();
                self.reporter.record(&sample);
                FrameOutcome::Matched(sample)
            }
            None => {
                if reason == UnmatchedReason::NoRecord {
                    self.metrics.record_fault(LatencyFault::UnmatchedFrame);
                }
                FrameOutcome::Unmatched(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency::barcode;
    use crate::latency::{Session, TagEncoding, TagGenerator};
    use crate::video::PixelFormat;
    use std::time::Duration;
    use uuid::Uuid;

    fn params(retention_ms: u64) -> LatencyParams {
        LatencyParams { retention_ms, ..LatencyParams::default() }
    }

    fn frame_with_tag(id: u64) -> RawFrame {
        let mut frame = RawFrame::filled(640, 480, PixelFormat::BGR24, 100);
        assert!(barcode::stamp(&mut frame, id, 16));
        frame
    }

    fn corrupted_frame(id: u64) -> RawFrame {
        let mut frame = frame_with_tag(id);
        // Smear the data cells while keeping the guard pattern intact
        let layout = barcode::BarcodeLayout::new(640, 480, 16).unwrap();
        for n in [10, 11, 12] {
            let (x, y) = layout.cell_origin(n);
            let px = ((y + 8) as usize * 640 + (x + 8) as usize) * 3;
            let level = if frame.data[px] > 128 { 0 } else { 255 };
            frame.fill_rect(x, y, 16, 16, level);
        }
        frame
    }

    #[test]
    fn lost_and_corrupted_frames_yield_no_samples() {
        let mut probe = LatencyProbe::new(&params(2000), 30, Arc::new(LatencyMetrics::new()));
        let session = Uuid::new_v4();
        let t0 = Instant::now();

        {
            let table = probe.table();
            let mut table = table.lock().unwrap();
            for id in 0..5u64 {
                let send_time = id as f64 * 0.1;
                table.insert_at(TimestampRecord { session, sequence_id: id, send_time }, t0);
            }
        }

        let mut samples = Vec::new();
        let frames = [
            (frame_with_tag(0), 0.05),
            (corrupted_frame(1), 0.15),
            (frame_with_tag(2), 0.25),
            (frame_with_tag(3), 0.35),
            (corrupted_frame(4), 0.45),
        ];
        for (frame, at) in &frames {
            let now = t0 + Duration::from_secs_f64(*at);
            if let FrameOutcome::Matched(sample) = probe.on_frame_at(frame, now, *at) {
                samples.push(sample);
            }
        }

        let got: Vec<(u64, f64)> = samples.iter().map(|s| (s.sequence_id, s.latency)).collect();
        assert_eq!(got.len(), 3);
        for ((id, latency), expected_id) in got.iter().zip([0, 2, 3]) {
            assert_eq!(*id, expected_id);
            assert!((latency - 0.05).abs() < 1e-9, "latency for {} was {}", id, latency);
        }

        // 1 and 4 stay unconsumed until they age out, and never produce samples
        let later = t0 + Duration::from_secs(3);
        let blank = RawFrame::filled(640, 480, PixelFormat::BGR24, 100);
        assert_eq!(
            probe.on_frame_at(&blank, later, 3.0),
            FrameOutcome::Unmatched(UnmatchedReason::TagAbsent)
        );
        assert_eq!(
            probe.on_frame_at(&frame_with_tag(1), later, 3.0),
            FrameOutcome::Unmatched(UnmatchedReason::NoRecord)
        );

        let snapshot = probe.metrics().snapshot();
        assert_eq!(snapshot.matched, 3);
        assert_eq!(snapshot.decode_failures, 2);
        assert_eq!(snapshot.unmatched, 1);
        assert_eq!(snapshot.evicted, 2);
        assert_eq!(probe.reporter().snapshot().samples, 3);
    }

    #[test]
    fn expired_record_produces_no_sample() {
        let mut probe = LatencyProbe::new(&params(1000), 30, Arc::new(LatencyMetrics::new()));
        let t0 = Instant::now();
        probe.table().lock().unwrap().insert_at(
            TimestampRecord { session: Uuid::new_v4(), sequence_id: 7, send_time: 0.0 },
            t0,
        );

        let outcome = probe.on_frame_at(&frame_with_tag(7), t0 + Duration::from_millis(1500), 1.5);
        assert_eq!(outcome, FrameOutcome::Unmatched(UnmatchedReason::NoRecord));
    }

    #[test]
    fn frame_before_its_record_is_unmatched() {
        let mut probe = LatencyProbe::new(&params(2000), 30, Arc::new(LatencyMetrics::new()));
        let outcome = probe.on_frame(&frame_with_tag(0));
        assert_eq!(outcome, FrameOutcome::Unmatched(UnmatchedReason::NoRecord));

        // The late record does not retroactively match
        probe.ingest(TimestampRecord { session: Uuid::new_v4(), sequence_id: 0, send_time: 0.0 });
        assert_eq!(probe.metrics().snapshot().matched, 0);
    }

    #[test]
    fn arrival_order_fallback_pairs_untagged_frames() {
        let params = LatencyParams {
            correlation: CorrelationMode::ArrivalOrder,
            ..LatencyParams::default()
        };
        let mut probe = LatencyProbe::new(&params, 30, Arc::new(LatencyMetrics::new()));
        let mut generator = TagGenerator::new(Session::start(), TagEncoding::ArrivalIndex);
        let t0 = Instant::now();

        for _ in 0..2 {
            let tag = generator.next_tag();
            let mut record = generator.record_for(&tag);
            record.send_time = 10.0 + tag.sequence_id as f64;
            probe.table().lock().unwrap().insert_at(record, t0);
        }

        let blank = RawFrame::filled(640, 480, PixelFormat::BGR24, 100);
        let first = probe.on_frame_at(&blank, t0, 10.5);
        let second = probe.on_frame_at(&blank, t0, 11.5);
        let third = probe.on_frame_at(&blank, t0, 12.5);

        assert_eq!(first.sample().map(|s| s.sequence_id), Some(0));
        assert_eq!(second.sample().map(|s| s.sequence_id), Some(1));
        assert_eq!(third, FrameOutcome::Unmatched(UnmatchedReason::TagAbsent));
    }

    #[test]
    fn arrival_order_skips_frames_with_unreadable_tags() {
        let params = LatencyParams {
            correlation: CorrelationMode::ArrivalOrder,
            ..LatencyParams::default()
        };
        let mut probe = LatencyProbe::new(&params, 30, Arc::new(LatencyMetrics::new()));
        let t0 = Instant::now();
        probe.table().lock().unwrap().insert_at(
            TimestampRecord { session: Uuid::new_v4(), sequence_id: 0, send_time: 10.0 },
            t0,
        );

        let outcome = probe.on_frame_at(&corrupted_frame(5), t0, 10.05);
        assert_eq!(outcome, FrameOutcome::Unmatched(UnmatchedReason::DecodeFailed));
        assert!(outcome.sample().is_none());

        // The pending record is still there for the next untagged frame
        let blank = RawFrame::filled(640, 480, PixelFormat::BGR24, 100);
        let next = probe.on_frame_at(&blank, t0, 10.1);
        assert_eq!(next.sample().map(|s| s.sequence_id), Some(0));
        assert_eq!(probe.metrics().snapshot().decode_failures, 1);
    }
}
