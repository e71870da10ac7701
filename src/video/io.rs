/*!
 * Raw Frame Pipes
 *
 * Fixed-size frame reads from an ffmpeg `-f rawvideo` stdout and writes into
 * an ffmpeg rawvideo stdin.
 */

use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::frame::{PixelFormat, RawFrame};
use crate::error::{Result, StreamError};

/// Reads whole frames from a rawvideo byte stream.
pub struct FrameReader<R> {
    inner: R,
    width: u32,
    height: u32,
    format: PixelFormat,
    frames_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, width: u32, height: u32, format: PixelFormat) -> Self {
        Self { inner, width, height, format, frames_read: 0 }
    }

    /// Size of one frame in bytes
    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }

    /// Read the next frame. Returns `Ok(None)` once the stream ends.
    ///
    /// Not cancel safe: a dropped read leaves the stream mid-frame. Run it on
    /// its own task and hand frames out through a channel.
    pub async fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let mut data = vec![0u8; self.frame_size()];
        match self.inner.read_exact(&mut data).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("Frame pipe closed after {} frames", self.frames_read);
                return Ok(None);
            }
            Err(e) => return Err(StreamError::frame_io("reading rawvideo frame", e)),
        }

        let frame = RawFrame::new(data, self.width, self.height, self.format, self.frames_read);
        self.frames_read += 1;
        Ok(Some(frame))
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

/// Writes whole frames into a rawvideo byte stream.
pub struct FrameWriter<W> {
    inner: W,
    frames_written: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, frames_written: 0 }
    }

    pub async fn write_frame(&mut self, frame: &RawFrame) -> Result<()> {
        self.inner
            .write_all(&frame.data)
            .await
            .map_err(|e| StreamError::frame_io("writing rawvideo frame", e))?;
        self.frames_written += 1;
        Ok(())
    }

    /// Flush and close the write side, signalling EOF to the consumer.
    pub async fn finish(mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| StreamError::frame_io("closing rawvideo pipe", e))
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}
