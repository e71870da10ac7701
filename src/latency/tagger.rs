//! Sender-side tagging: number the frame, draw the number, publish the time.

use std::sync::Arc;
use tracing::{debug, warn};

use super::{barcode, FrameTag, TagEncoding, TagGenerator};
use crate::error::LatencyFault;
use crate::metrics::LatencyMetrics;
use crate::side_channel::TimestampSink;
use crate::video::RawFrame;

pub struct Tagger<S> {
    generator: TagGenerator,
    sink: S,
    cell_size: u32,
    metrics: Arc<LatencyMetrics>,
    dropped: u64,
}

impl<S: TimestampSink> Tagger<S> {
    pub fn new(
        generator: TagGenerator,
        sink: S,
        cell_size: u32,
        metrics: Arc<LatencyMetrics>,
    ) -> Self {
        Self { generator, sink, cell_size, metrics, dropped: 0 }
    }

    pub fn generator(&self) -> &TagGenerator {
        &self.generator
    }

    /// Give the sink back, e.g. to flush it on shutdown.
    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn next_tag(&mut self) -> FrameTag {
        self.generator.next_tag()
    }

    /// Draw `tag` into `frame` if it travels in the pixels.
    pub fn stamp(&self, frame: &mut RawFrame, tag: &FrameTag) -> bool {
        match tag.encoding {
            TagEncoding::Barcode => {
                let stamped = barcode::stamp(frame, tag.sequence_id, self.cell_size);
                if !stamped {
                    debug!("Frame {} could not carry a barcode", tag.sequence_id);
                }
                stamped
            }
            TagEncoding::ArrivalIndex => true,
        }
    }

    /// Publish the send time of `tag`. Never blocks and never fails the
    /// caller; a record that cannot be queued is counted as a dropped sample.
    pub fn emit_timestamp(&mut self, tag: &FrameTag) -> bool {
        let record = self.generator.record_for(tag);
        match self.sink.try_publish(record) {
            Ok(()) => {
                self.metrics.record_tag_emitted();
                true
            }
            Err(e) => {
                self.metrics.record_fault(LatencyFault::SideChannelUnavailable);
                self.dropped += 1;
                if self.dropped == 1 {
                    warn!("Dropping latency sample for frame {}: {}", tag.sequence_id, e);
                } else {
                    debug!("Dropping latency sample for frame {}: {}", tag.sequence_id, e);
                }
                false
            }
        }
    }

    /// Tag a frame that is about to be written to the encoder.
    pub fn tag_frame(&mut self, frame: &mut RawFrame) -> FrameTag {
        let tag = self.next_tag();
        self.stamp(frame, &tag);
        self.emit_timestamp(&tag);
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency::{Session, TimestampRecord};
    use crate::side_channel::PublishError;
    use crate::video::PixelFormat;
    use std::sync::Mutex;

    /// Sink that records what it accepts and rejects chosen sequence ids.
    #[derive(Clone, Default)]
    struct FlakySink {
        pub accepted: Arc<Mutex<Vec<TimestampRecord>>>,
        pub fail_ids: Vec<u64>,
    }

    impl TimestampSink for FlakySink {
        fn try_publish(&self, record: TimestampRecord) -> Result<(), PublishError> {
            if self.fail_ids.contains(&record.sequence_id) {
                return Err(PublishError::QueueFull);
            }
            self.accepted.lock().unwrap().push(record);
            Ok(())
        }
    }

    fn tagger(sink: FlakySink, metrics: Arc<LatencyMetrics>) -> Tagger<FlakySink> {
        let generator = TagGenerator::new(Session::start(), TagEncoding::Barcode);
        Tagger::new(generator, sink, 16, metrics)
    }

    #[test]
    fn tagged_frames_carry_their_id() {
        let sink = FlakySink::default();
        let metrics = Arc::new(LatencyMetrics::new());
        let mut tagger = tagger(sink.clone(), metrics.clone());

        for expected in 0..3 {
            let mut frame = RawFrame::filled(640, 480, PixelFormat::BGR24, 128);
            let tag = tagger.tag_frame(&mut frame);
            assert_eq!(tag.sequence_id, expected);
            assert_eq!(
                barcode::decode(&frame.data, 640, 480, PixelFormat::BGR24, 16),
                Some(expected)
            );
        }

        let accepted = sink.accepted.lock().unwrap();
        assert_eq!(accepted.len(), 3);
        assert!(accepted.iter().all(|r| r.session == tagger.generator().session().id()));
        assert_eq!(metrics.snapshot().tags_emitted, 3);
    }

    #[test]
    fn failed_send_does_not_stop_tagging() {
        let sink = FlakySink { fail_ids: vec![1], ..Default::default() };
        let metrics = Arc::new(LatencyMetrics::new());
        let mut tagger = tagger(sink.clone(), metrics.clone());

        let mut frames = Vec::new();
        for _ in 0..3 {
            let mut frame = RawFrame::filled(640, 480, PixelFormat::BGR24, 128);
            tagger.tag_frame(&mut frame);
            frames.push(frame);
        }

        // The frame whose record was dropped is still tagged and streamable
        assert_eq!(barcode::decode(&frames[1].data, 640, 480, PixelFormat::BGR24, 16), Some(1));
        let ids: Vec<u64> = sink.accepted.lock().unwrap().iter().map(|r| r.sequence_id).collect();
        assert_eq!(ids, vec![0, 2]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tags_emitted, 2);
        assert_eq!(snapshot.samples_dropped, 1);
        assert_eq!(tagger.dropped, 1);
    }

    #[test]
    fn arrival_index_leaves_pixels_alone() {
        let generator = TagGenerator::new(Session::start(), TagEncoding::ArrivalIndex);
        let mut tagger = Tagger::new(
            generator,
            FlakySink::default(),
            16,
            Arc::new(LatencyMetrics::new()),
        );
        let mut frame = RawFrame::filled(640, 480, PixelFormat::BGR24, 128);
        let original = frame.data.clone();
        tagger.tag_frame(&mut frame);
        assert_eq!(frame.data, original);
    }
}
