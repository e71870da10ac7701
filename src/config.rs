//! Shared parameter file for the three roles.
//!
//! The robot streamer, the operator viewer and the recorder all read the same
//! `params.yaml`. Every field has a default so a partial file (or just the
//! `video`/`network` sections) is enough.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, StreamError};
use crate::latency::barcode::BarcodeLayout;

/// Default location of the shared parameter file, relative to a role's
/// working directory.
pub const DEFAULT_CONFIG_PATH: &str = "../params.yaml";

/// Root of `params.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub video: VideoParams,
    pub network: NetworkParams,
    pub latency: LatencyParams,
    pub display: DisplayParams,
    pub recorder: RecorderParams,
}

/// Capture and encoding parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Target encoder bitrate in kbps
    pub bitrate_kbps: u32,
    /// Capture device override (`/dev/video2`, `1`, `video=Integrated Camera`)
    pub device: Option<String>,
    /// ffmpeg input format override (`video4linux2`, `avfoundation`, `dshow`)
    pub input_format: Option<String>,
    /// Pixel format requested from the capture device
    pub input_pixel_format: Option<String>,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            framerate: 30,
            bitrate_kbps: 1000,
            device: None,
            input_format: None,
            input_pixel_format: None,
        }
    }
}

/// Addresses and ports of the video transport and the timestamp side-channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkParams {
    /// Host running the operator viewer (and usually the recorder)
    pub operator_ip: IpAddr,
    pub video_port: u16,
    /// Address the receivers bind to
    pub listen_ip: IpAddr,
    /// Side-channel port of the viewer
    pub timestamp_port: u16,
    /// Separate video port for the recorder; when set the sender feeds both
    pub recorder_video_port: Option<u16>,
    /// Side-channel port of the recorder
    pub recorder_timestamp_port: Option<u16>,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            operator_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            video_port: 5000,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            timestamp_port: 5001,
            recorder_video_port: None,
            recorder_timestamp_port: Some(5003),
        }
    }
}

impl NetworkParams {
    /// Endpoints the sender publishes timestamp records to.
    pub fn timestamp_targets(&self) -> Vec<SocketAddr> {
        let mut targets = vec![SocketAddr::new(self.operator_ip, self.timestamp_port)];
        if let Some(port) = self.recorder_timestamp_port {
            if port != self.timestamp_port {
                targets.push(SocketAddr::new(self.operator_ip, port));
            }
        }
        targets
    }

    /// Side-channel bind address of the viewer.
    pub fn viewer_timestamp_bind(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.timestamp_port)
    }

    /// Side-channel bind address of the recorder.
    pub fn recorder_timestamp_bind(&self) -> SocketAddr {
        let port = self.recorder_timestamp_port.unwrap_or(self.timestamp_port);
        SocketAddr::new(self.listen_ip, port)
    }

    /// Video port the recorder listens on.
    pub fn recorder_video_port(&self) -> u16 {
        self.recorder_video_port.unwrap_or(self.video_port)
    }
}

/// How received frames are paired with timestamp records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMode {
    /// Read the sequence id from the barcode drawn into the frame
    #[default]
    Barcode,
    /// Like `Barcode`, but an untagged frame consumes the oldest pending record
    ArrivalOrder,
}

/// Frame-tagging and latency aggregation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyParams {
    pub enabled: bool,
    /// How long an unmatched timestamp record is kept, in milliseconds
    pub retention_ms: u64,
    /// Number of samples in the rolling average
    pub window: usize,
    /// Barcode cell edge in pixels
    pub cell_size: u32,
    /// Pending timestamp records on the sender before new ones are dropped
    pub queue_capacity: usize,
    pub correlation: CorrelationMode,
}

impl Default for LatencyParams {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_ms: 2000,
            window: 10,
            cell_size: 16,
            queue_capacity: 64,
            correlation: CorrelationMode::Barcode,
        }
    }
}

impl LatencyParams {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Viewer window parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayParams {
    /// Render the FPS/latency overlay with ffplay's drawtext filter
    pub overlay: bool,
    pub window_title: String,
}

impl Default for DisplayParams {
    fn default() -> Self {
        Self { overlay: true, window_title: "Avatar Operator Viewer".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderParams {
    pub output_dir: PathBuf,
}

impl Default for RecorderParams {
    fn default() -> Self {
        Self { output_dir: PathBuf::from("recordings") }
    }
}

impl Params {
    /// Load and validate a parameter file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| StreamError::ConfigRead { path: path.to_path_buf(), source })?;
        let params = Self::from_yaml(&text)
            .map_err(|source| StreamError::ConfigParse { path: path.to_path_buf(), source })?;
        params.validate()?;
        debug!("Loaded parameters from {}: {:?}", path.display(), params);
        Ok(params)
    }

    /// Parse without validating.
    pub fn from_yaml(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        // An empty file deserializes to `null`, which we treat as all-defaults.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Check the values the pipelines depend on.
    pub fn validate(&self) -> Result<()> {
        let video = &self.video;
        if video.width == 0 || video.height == 0 {
            return Err(StreamError::invalid_config("video", "width and height must be non-zero"));
        }
        // libx264 with yuv420p needs even dimensions
        if video.width % 2 != 0 || video.height % 2 != 0 {
            return Err(StreamError::invalid_config(
                "video",
                format!("{}x{} must have even dimensions", video.width, video.height),
            ));
        }
        if video.framerate == 0 {
            return Err(StreamError::invalid_config("video.framerate", "must be at least 1"));
        }
        if video.bitrate_kbps == 0 {
            return Err(StreamError::invalid_config("video.bitrate_kbps", "must be at least 1"));
        }
        if self.network.video_port == 0 || self.network.timestamp_port == 0 {
            return Err(StreamError::invalid_config("network", "ports must be non-zero"));
        }

        let latency = &self.latency;
        if latency.enabled {
            if latency.window == 0 {
                return Err(StreamError::invalid_config("latency.window", "must be at least 1"));
            }
            if latency.queue_capacity == 0 {
                return Err(StreamError::invalid_config(
                    "latency.queue_capacity",
                    "must be at least 1",
                ));
            }
            if latency.retention_ms == 0 {
                return Err(StreamError::invalid_config(
                    "latency.retention_ms",
                    "must be at least 1",
                ));
            }
            if BarcodeLayout::new(video.width, video.height, latency.cell_size).is_none() {
                return Err(StreamError::invalid_config(
                    "latency.cell_size",
                    format!(
                        "a {}px barcode does not fit a {}x{} frame",
                        latency.cell_size, video.width, video.height
                    ),
                ));
            }
        }
        Ok(())
    }
}
