//! Error types for the streaming roles.
//!
//! Everything that can stop a role from starting or keep its external ffmpeg
//! pipeline from running is a [`StreamError`]. Latency measurement problems
//! are *not* errors: they are [`LatencyFault`]s, counted and otherwise ignored
//! so that the video path never stops because a tag could not be read.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for streaming operations.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Main error type for the streamer, viewer and recorder.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    #[error("Failed to read configuration file {path}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file {path}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Failed to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {status}")]
    ProcessExited { program: String, status: String },

    #[error("Pipe to {program} is not available: {pipe}")]
    PipeUnavailable { program: String, pipe: &'static str },

    #[error("Frame I/O failed: {context}")]
    FrameIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Side-channel socket error on {endpoint}")]
    SideChannel {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
}

impl StreamError {
    /// Helper constructor for validation failures.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        StreamError::InvalidConfig { field: field.into(), reason: reason.into() }
    }

    /// Helper constructor for spawn failures.
    pub fn spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        StreamError::Spawn { program: program.into(), source }
    }

    /// Helper constructor for frame pipe failures.
    pub fn frame_io(context: impl Into<String>, source: std::io::Error) -> Self {
        StreamError::FrameIo { context: context.into(), source }
    }

    /// Helper constructor for side-channel socket failures.
    pub fn side_channel(endpoint: impl ToString, source: std::io::Error) -> Self {
        StreamError::SideChannel { endpoint: endpoint.to_string(), source }
    }
}

/// Recoverable latency-measurement conditions.
///
/// None of these interrupt streaming, display or recording. They only show up
/// as missing latency data and in the counters of
/// [`LatencyMetrics`](crate::metrics::LatencyMetrics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyFault {
    /// The tag on a received frame was unreadable.
    TagDecodeFailure,
    /// A timestamp could not be sent or a datagram could not be received.
    SideChannelUnavailable,
    /// The frame carried a tag but no timestamp record was pending for it.
    UnmatchedFrame,
}

impl std::fmt::Display for LatencyFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LatencyFault::TagDecodeFailure => "tag decode failure",
            LatencyFault::SideChannelUnavailable => "side-channel unavailable",
            LatencyFault::UnmatchedFrame => "unmatched frame",
        };
        f.write_str(name)
    }
}
