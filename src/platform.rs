//! Host detection and the capture backend that goes with it.

use serde::{Deserialize, Serialize};

use crate::config::VideoParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub hostname: String,
}

/// Get platform name
pub fn get_platform_name() -> &'static str {
    #[cfg(target_os = "windows")]
    return "windows";

    #[cfg(target_os = "macos")]
    return "macos";

    #[cfg(target_os = "linux")]
    return "linux";

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    return "unknown";
}

/// Get system information
pub fn get_system_info() -> SystemInfo {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    SystemInfo {
        os: get_platform_name().to_string(),
        arch: std::env::consts::ARCH.to_string(),
        hostname,
    }
}

/// ffmpeg input arguments for the camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureBackend {
    /// `-f` value
    pub input_format: String,
    /// `-i` value
    pub device: String,
    /// `-pix_fmt` requested from the device, if the backend needs one
    pub pixel_format: Option<String>,
}

impl CaptureBackend {
    /// Default backend for the host this binary was built for.
    pub fn detect() -> Self {
        Self::for_platform(get_platform_name())
    }

    pub fn for_platform(platform: &str) -> Self {
        match platform {
            "macos" => Self {
                input_format: "avfoundation".to_string(),
                device: "0".to_string(),
                pixel_format: Some("0rgb".to_string()),
            },
            "windows" => Self {
                input_format: "dshow".to_string(),
                device: "video=Integrated Camera".to_string(),
                pixel_format: None,
            },
            _ => Self {
                input_format: "video4linux2".to_string(),
                device: "/dev/video0".to_string(),
                pixel_format: None,
            },
        }
    }

    /// Detected backend with any overrides from the `video` section applied.
    pub fn resolve(video: &VideoParams) -> Self {
        let mut backend = Self::detect();
        backend.apply(video);
        backend
    }

    pub fn apply(&mut self, video: &VideoParams) {
        if let Some(format) = &video.input_format {
            self.input_format = format.clone();
        }
        if let Some(device) = &video.device {
            self.device = device.clone();
        }
        if let Some(pix_fmt) = &video.input_pixel_format {
            self.pixel_format = Some(pix_fmt.clone());
        }
    }
}
