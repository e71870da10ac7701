/*!
 * Avatar Stream Library
 *
 * Robot camera streamer, operator viewer and recorder built around ffmpeg,
 * with per-frame tagging to measure glass-to-glass latency.
 */

pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod latency;
pub mod logging;
pub mod metrics;
pub mod platform;
pub mod side_channel;
pub mod streaming;
pub mod video;

// Re-export commonly used types
pub use config::{Params, DEFAULT_CONFIG_PATH};
pub use error::{LatencyFault, Result, StreamError};
pub use latency::{FrameTag, LatencySample, Session, TagGenerator, TimestampRecord};
pub use metrics::{LatencyMetrics, MetricsSnapshot};
