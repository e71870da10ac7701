//! Frame-tag latency measurement.
//!
//! The sender stamps every outgoing frame with a [`FrameTag`] and publishes a
//! matching [`TimestampRecord`] on the side-channel. Receivers read the tag
//! back out of the decoded frame, look the record up in a
//! [`CorrelationTable`] and turn the pair into a [`LatencySample`].

pub mod barcode;
pub mod correlation;
pub mod probe;
pub mod reporter;
pub mod tagger;

pub use barcode::{BarcodeLayout, DecodeOutcome, TagDecoder};
pub use correlation::CorrelationTable;
pub use probe::{FrameOutcome, LatencyProbe, UnmatchedReason};
pub use reporter::{FpsCounter, LatencyLevel, LatencyReporter, LatencySnapshot};
pub use tagger::Tagger;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifier of one sender run.
pub type SessionId = Uuid;

/// Current wall-clock time as float seconds since the UNIX epoch.
pub fn unix_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// How a tag travels with its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagEncoding {
    /// Drawn into the frame pixels, see [`barcode`]
    Barcode,
    /// Not embedded; receivers pair frames with records by arrival order
    ArrivalIndex,
}

/// Per-frame correlation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTag {
    pub sequence_id: u64,
    pub encoding: TagEncoding,
}

/// Send-time record published on the side-channel for one tagged frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimestampRecord {
    pub session: SessionId,
    pub sequence_id: u64,
    /// Seconds since the UNIX epoch
    pub send_time: f64,
}

/// One measured frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub sequence_id: u64,
    pub send_time: f64,
    pub receive_time: f64,
    /// `receive_time - send_time`, in seconds. Negative only with clock skew.
    pub latency: f64,
}

impl LatencySample {
    pub fn new(record: &TimestampRecord, receive_time: f64) -> Self {
        Self {
            sequence_id: record.sequence_id,
            send_time: record.send_time,
            receive_time,
            latency: receive_time - record.send_time,
        }
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency * 1000.0
    }
}

/// Scope of sequence id uniqueness, one per sender run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    next_sequence: u64,
}

impl Session {
    /// Begin a fresh session: new id, sequence starting at zero.
    pub fn start() -> Self {
        Self { id: Uuid::new_v4(), next_sequence: 0 }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }
}

/// Hands out strictly increasing sequence ids within an explicit [`Session`].
#[derive(Debug)]
pub struct TagGenerator {
    session: Session,
    encoding: TagEncoding,
}

impl TagGenerator {
    pub fn new(session: Session, encoding: TagEncoding) -> Self {
        Self { session, encoding }
    }

    /// Next tag: `0` on the first call, previous + 1 afterwards.
    pub fn next_tag(&mut self) -> FrameTag {
        let sequence_id = self.session.next_sequence;
        self.session.next_sequence += 1;
        FrameTag { sequence_id, encoding: self.encoding }
    }

    /// Record for `tag`, stamped with the current wall-clock time.
    pub fn record_for(&self, tag: &FrameTag) -> TimestampRecord {
        TimestampRecord {
            session: self.session.id,
            sequence_id: tag.sequence_id,
            send_time: unix_now_secs(),
        }
    }

    /// Replace the session, as on a sender restart.
    pub fn reset(&mut self) -> SessionId {
        self.session = Session::start();
        self.session.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}
