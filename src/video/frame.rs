/*!
 * Video Frame Representation
 *
 * Raw frames as they travel through the rawvideo pipes between ffmpeg and
 * the tagging/probing code.
 */

use std::time::Instant;

/// Pixel format for raw frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// BGR 24-bit (ffmpeg `bgr24`)
    BGR24,
}

impl PixelFormat {
    /// Get bytes per pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::BGR24 => 3,
        }
    }

    /// Name of the format on the ffmpeg command line
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::BGR24 => "bgr24",
        }
    }

    /// Byte offsets of (R, G, B) within one pixel
    pub fn rgb_offsets(&self) -> (usize, usize, usize) {
        match self {
            PixelFormat::BGR24 => (2, 1, 0),
        }
    }

    /// Bytes needed for one frame of the given size
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

/// Raw uncompressed video frame
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame pixel data
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format
    pub format: PixelFormat,
    /// Position of the frame in the pipe it was read from
    pub index: u64,
    /// When the frame was read off the pipe
    pub received_at: Instant,
}

impl RawFrame {
    /// Create a new raw frame
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        index: u64,
    ) -> Self {
        Self {
            data,
            width,
            height,
            format,
            index,
            received_at: Instant::now(),
        }
    }

    /// Create a frame filled with a single grey level
    pub fn filled(width: u32, height: u32, format: PixelFormat, level: u8) -> Self {
        let data = vec![level; format.frame_size(width, height)];
        Self::new(data, width, height, format, 0)
    }

    /// Get expected data size for this frame
    pub fn expected_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }

    /// Validate frame data size
    pub fn is_valid(&self) -> bool {
        self.data.len() == self.expected_size()
    }

    /// Paint an axis-aligned rectangle with a grey level, clipped to the frame
    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, level: u8) {
        self.fill_rect_rgb(x, y, w, h, (level, level, level));
    }

    /// Paint an axis-aligned rectangle with an (R, G, B) colour, clipped to
    /// the frame.
    pub fn fill_rect_rgb(&mut self, x: u32, y: u32, w: u32, h: u32, rgb: (u8, u8, u8)) {
        let bpp = self.format.bytes_per_pixel();
        let (ro, go, bo) = self.format.rgb_offsets();
        let x_end = x.saturating_add(w).min(self.width);
        let y_end = y.saturating_add(h).min(self.height);
        for row in y.min(self.height)..y_end {
            let start = (row as usize * self.width as usize + x as usize) * bpp;
            let end = (row as usize * self.width as usize + x_end as usize) * bpp;
            if x >= x_end || end > self.data.len() {
                continue;
            }
            for px in self.data[start..end].chunks_exact_mut(bpp) {
                px[ro] = rgb.0;
                px[go] = rgb.1;
                px[bo] = rgb.2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format() {
        assert_eq!(PixelFormat::BGR24.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::BGR24.frame_size(640, 480), 640 * 480 * 3);
        assert_eq!(PixelFormat::BGR24.ffmpeg_name(), "bgr24");
        assert_eq!(PixelFormat::BGR24.rgb_offsets(), (2, 1, 0));
    }

    #[test]
    fn test_raw_frame_creation() {
        let data = vec![0u8; 640 * 480 * 3];
        let frame = RawFrame::new(data, 640, 480, PixelFormat::BGR24, 7);

        assert_eq!(frame.width, 640);
        assert_eq!(frame.height, 480);
        assert_eq!(frame.index, 7);
        assert!(frame.is_valid());
    }

    #[test]
    fn test_frame_validation() {
        let data = vec![0u8; 100]; // Too small
        let frame = RawFrame::new(data, 640, 480, PixelFormat::BGR24, 0);
        assert!(!frame.is_valid());
    }

    #[test]
    fn test_fill_rect_clips() {
        let mut frame = RawFrame::filled(4, 2, PixelFormat::BGR24, 0);
        frame.fill_rect(2, 1, 10, 10, 200);

        // Untouched pixel
        assert_eq!(&frame.data[0..3], &[0, 0, 0]);
        // (2,1) and (3,1) painted
        let idx = (4 + 2) * 3;
        assert_eq!(&frame.data[idx..idx + 3], &[200, 200, 200]);
        let idx = (4 + 3) * 3;
        assert_eq!(&frame.data[idx..idx + 3], &[200, 200, 200]);
        assert!(frame.is_valid());
    }

    #[test]
    fn colour_rect_respects_channel_order() {
        let mut frame = RawFrame::filled(4, 4, PixelFormat::BGR24, 0);
        frame.fill_rect_rgb(1, 1, 1, 1, (255, 128, 0));
        let px = (4 + 1) * 3;
        assert_eq!(&frame.data[px..px + 3], &[0, 128, 255]);
        assert_eq!(&frame.data[0..3], &[0, 0, 0]);
    }
}
