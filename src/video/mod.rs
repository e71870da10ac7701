/*!
 * Video Module
 *
 * Raw frame types, rawvideo pipe I/O and the encoder rate settings handed to
 * ffmpeg.
 */

pub mod frame;
pub mod io;

pub use frame::{PixelFormat, RawFrame};
pub use io::{FrameReader, FrameWriter};

/// Constant-ish bitrate envelope for the libx264 encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateControl {
    /// Target bitrate in kbps
    pub bitrate_kbps: u32,
    /// Lower bound (80% of target)
    pub minrate_kbps: u32,
    /// Upper bound (120% of target)
    pub maxrate_kbps: u32,
    /// VBV buffer size in kbit
    pub bufsize_kbps: u32,
}

impl RateControl {
    pub fn new(bitrate_kbps: u32) -> Self {
        Self {
            bitrate_kbps,
            minrate_kbps: bitrate_kbps * 4 / 5,
            maxrate_kbps: bitrate_kbps * 6 / 5,
            bufsize_kbps: bitrate_kbps,
        }
    }
}

/// Keyframe cadence for a given framerate: a GOP of two seconds, with at
/// least one second between forced keyframes.
pub fn gop_for_framerate(framerate: u32) -> (u32, u32) {
    (framerate * 2, framerate)
}
