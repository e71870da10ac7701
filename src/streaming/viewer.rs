//! Operator-side viewer.
//!
//! ffmpeg decodes the UDP stream to raw frames; every frame goes through the
//! latency probe and on to an ffplay window whose overlay shows FPS and
//! latency. Headless mode skips the window and logs the same figures.

use std::future::Future;
use std::net::SocketAddr;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::ChildStdin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Params;
use crate::error::Result;
use crate::ffmpeg::{self, ManagedProcess, PIPE_FORMAT};
use crate::latency::{FpsCounter, LatencyLevel, LatencyProbe, LatencySnapshot};
use crate::metrics::{LatencyMetrics, MetricsSnapshot};
use crate::side_channel::TimestampSubscriber;
use crate::video::{FrameWriter, RawFrame};

use super::overlay::{OverlayFile, WAITING_TEXT};
use super::{
    join_task, spawn_frame_reader, spawn_metrics_logger, FRAME_QUEUE_CAPACITY, STALL_NOTICE,
    VIEWER_STOP_GRACE,
};

const OVERLAY_REFRESH: Duration = Duration::from_millis(250);
const HEADLESS_LOG_PERIOD: Duration = Duration::from_secs(1);
const METRICS_PERIOD: Duration = Duration::from_secs(10);

/// Edge of the latency grade badge in the top-right corner.
const BADGE_SIZE: u32 = 24;

/// Paint the colour grade of `level` in the top-right corner, away from the
/// barcode in the top-left.
pub fn paint_level_badge(frame: &mut RawFrame, level: LatencyLevel) {
    let size = BADGE_SIZE.min(frame.width).min(frame.height);
    let margin = size / 3;
    let x = frame.width.saturating_sub(size + margin);
    frame.fill_rect_rgb(x, margin, size, size, level.rgb());
}

#[derive(Debug, Clone, Default)]
pub struct ViewerOptions {
    /// No ffplay window, figures go to the log only
    pub headless: bool,
}

#[derive(Debug, Clone)]
pub struct ViewerReport {
    pub frames: u64,
    pub frames_dropped: u64,
    pub latency: LatencySnapshot,
    pub metrics: MetricsSnapshot,
}

/// ffplay window plus the pipe feeding it.
struct Display {
    process: ManagedProcess,
    writer: FrameWriter<ChildStdin>,
    overlay: Option<OverlayFile>,
}

impl Display {
    fn start(params: &Params) -> Result<Self> {
        let overlay = if params.display.overlay {
            Some(OverlayFile::in_temp_dir()?)
        } else {
            None
        };
        let command = ffmpeg::display_command(
            &params.video,
            &params.display.window_title,
            overlay.as_ref().map(|o| o.path()),
        );
        debug!("[Viewer] {}", command);
        let mut process = ManagedProcess::spawn("display", &command, Stdio::piped(), Stdio::null())?;
        let writer = FrameWriter::new(process.take_stdin()?);
        Ok(Self { process, writer, overlay })
    }

    fn show(&mut self, text: &str) {
        if let Some(overlay) = self.overlay.as_mut() {
            if let Err(e) = overlay.update(text) {
                debug!("[Viewer] Overlay update failed: {}", e);
            }
        }
    }
}

/// Resolves when the window is closed; never when there is none.
fn window_closed(display: &mut Option<Display>) -> impl Future<Output = Result<ExitStatus>> + '_ {
    async move {
        match display {
            Some(display) => display.process.wait().await,
            None => std::future::pending().await,
        }
    }
}

pub async fn run_viewer(
    params: &Params,
    options: &ViewerOptions,
    cancel: CancellationToken,
) -> Result<ViewerReport> {
    let video = &params.video;
    let network = &params.network;
    let metrics = Arc::new(LatencyMetrics::new());

    let mut probe = params
        .latency
        .enabled
        .then(|| LatencyProbe::new(&params.latency, video.framerate, metrics.clone()));

    let side_cancel = cancel.child_token();
    let subscriber = match &probe {
        Some(probe) => Some(
            TimestampSubscriber::start(
                network.viewer_timestamp_bind(),
                probe.table(),
                metrics.clone(),
                side_cancel.clone(),
            )
            .await?,
        ),
        None => None,
    };

    let video_bind = SocketAddr::new(network.listen_ip, network.video_port);
    let decode_cmd = ffmpeg::viewer_decode_command(video, video_bind);
    info!("[Viewer] Listening for video on {}", video_bind);
    debug!("[Viewer] {}", decode_cmd);
    let mut decoder = ManagedProcess::spawn("decoder", &decode_cmd, Stdio::null(), Stdio::piped())?;

    let reader_cancel = cancel.child_token();
    let (mut frames, queue_stats, reader) = spawn_frame_reader(
        decoder.take_stdout()?,
        video.width,
        video.height,
        PIPE_FORMAT,
        FRAME_QUEUE_CAPACITY,
        reader_cancel.clone(),
    );

    let mut display = if options.headless {
        info!("[Viewer] Headless mode, latency goes to the log only");
        None
    } else {
        Some(Display::start(params)?)
    };

    let logger = spawn_metrics_logger("Viewer", metrics.clone(), METRICS_PERIOD, cancel.clone());
    let mut fps = FpsCounter::new();
    let mut shown: u64 = 0;
    let mut waiting = false;
    let mut last_overlay = Instant::now();
    let mut last_log = Instant::now();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            status = window_closed(&mut display) => {
                match status {
                    Ok(status) => info!("[Viewer] Display window closed ({})", status),
                    Err(e) => warn!("[Viewer] Lost the display process: {}", e),
                }
                break;
            }
            next = tokio::time::timeout(STALL_NOTICE, frames.recv()) => next,
        };

        let mut frame: RawFrame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                warn!("[Viewer] Video decoder stopped");
                break;
            }
            Err(_) => {
                if !waiting {
                    info!("[Viewer] {}", WAITING_TEXT);
                    if let Some(display) = display.as_mut() {
                        display.show(WAITING_TEXT);
                    }
                    waiting = true;
                }
                continue;
            }
        };

        if waiting || shown == 0 {
            info!("[Viewer] ✅ Receiving video ({}x{})", frame.width, frame.height);
            waiting = false;
        }

        let now = Instant::now();
        if let Some(probe) = probe.as_mut() {
            probe.on_frame(&frame);
            if let Some(rate) = fps.tick(now) {
                probe.reporter_mut().set_fps(rate);
            }
        } else {
            fps.tick(now);
        }

        let snapshot = current_snapshot(probe.as_ref(), &fps);
        if let Some(display) = display.as_mut() {
            if display.overlay.is_some() {
                if now.duration_since(last_overlay) >= OVERLAY_REFRESH {
                    display.show(&snapshot.overlay_text());
                    last_overlay = now;
                }
                paint_level_badge(&mut frame, snapshot.level());
            }
            if let Err(e) = display.writer.write_frame(&frame).await {
                info!("[Viewer] Display closed: {}", e);
                break;
            }
        } else if now.duration_since(last_log) >= HEADLESS_LOG_PERIOD {
            info!("[Viewer] {}", snapshot.overlay_text().replace('\n', " | "));
            last_log = now;
        }
        shown += 1;
    }

    // Teardown: window, decoder, then the background tasks
    reader_cancel.cancel();
    if let Some(display) = display.take() {
        display.process.stop(VIEWER_STOP_GRACE).await;
    }
    decoder.stop(VIEWER_STOP_GRACE).await;
    drop(frames);
    if let Some(Err(e)) = join_task("frame reader", reader, VIEWER_STOP_GRACE).await {
        debug!("[Viewer] Frame reader ended with: {}", e);
    }
    if let Some(subscriber) = subscriber {
        side_cancel.cancel();
        subscriber.join().await;
    }
    logger.abort();

    let report = ViewerReport {
        frames: shown,
        frames_dropped: queue_stats.dropped(),
        latency: current_snapshot(probe.as_ref(), &fps),
        metrics: metrics.snapshot(),
    };
    info!(
        "[Viewer] Showed {} frames ({} dropped), {} latency samples",
        report.frames, report.frames_dropped, report.latency.samples
    );
    Ok(report)
}

fn current_snapshot(probe: Option<&LatencyProbe>, fps: &FpsCounter) -> LatencySnapshot {
    match probe {
        Some(probe) => probe.reporter().snapshot(),
        None => LatencySnapshot { fps: fps.fps(), ..LatencySnapshot::default() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::PixelFormat;

    #[test]
    fn badge_sits_top_right_in_grade_colour() {
        let mut frame = RawFrame::filled(640, 480, PixelFormat::BGR24, 0);
        paint_level_badge(&mut frame, LatencyLevel::Poor);

        // Centre of the badge: x = 640 - 24 - 8 + 12, y = 8 + 12
        let px = (20 * 640 + 620) * 3;
        assert_eq!(&frame.data[px..px + 3], &[0, 0, 255]);
        // Barcode corner untouched
        assert_eq!(&frame.data[0..3], &[0, 0, 0]);
    }

    #[test]
    fn badge_clips_on_tiny_frames() {
        let mut frame = RawFrame::filled(8, 8, PixelFormat::BGR24, 0);
        paint_level_badge(&mut frame, LatencyLevel::Good);
        assert!(frame.is_valid());
    }

    #[test]
    fn headless_snapshot_without_probe_reports_fps() {
        let fps = FpsCounter::new();
        let snapshot = current_snapshot(None, &fps);
        assert_eq!(snapshot.samples, 0);
        assert_eq!(snapshot.overlay_text(), "FPS: 0.0\nLatency: --");
    }
}
