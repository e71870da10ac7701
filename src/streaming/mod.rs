/*!
 * Streaming Roles
 *
 * Runners for the three processes: the robot streamer (`sender`), the
 * operator viewer (`viewer`) and the recorder (`recorder`). Each one wires
 * ffmpeg subprocesses to the latency path and runs until cancelled.
 */

pub mod overlay;
pub mod recorder;
pub mod sender;
pub mod viewer;

pub use overlay::OverlayFile;
pub use recorder::{run_recorder, RecorderOptions, RecordingReport};
pub use sender::{run_sender, SenderOptions, SenderReport};
pub use viewer::{run_viewer, ViewerOptions, ViewerReport};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics::LatencyMetrics;
use crate::video::{FrameReader, PixelFormat, RawFrame};

/// Decoded frames buffered between the reader task and the frame loop.
pub const FRAME_QUEUE_CAPACITY: usize = 10;

/// Silence after which receivers report that they are waiting for video.
pub const STALL_NOTICE: Duration = Duration::from_secs(1);

/// Grace period before a viewer-side process is killed.
pub const VIEWER_STOP_GRACE: Duration = Duration::from_secs(2);

/// Grace period for the recorder, which has to finalize its file.
pub const RECORDER_STOP_GRACE: Duration = Duration::from_secs(5);

/// Frame queue counters
#[derive(Debug, Default)]
pub struct QueueStats {
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl QueueStats {
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Frames discarded because the consumer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Read frames from `source` on a dedicated task.
///
/// When the queue is full the new frame is dropped so the consumer always
/// works on recent video. The channel closes when the pipe reaches EOF or
/// `cancel` fires.
pub fn spawn_frame_reader<R>(
    source: R,
    width: u32,
    height: u32,
    format: PixelFormat,
    capacity: usize,
    cancel: CancellationToken,
) -> (mpsc::Receiver<RawFrame>, Arc<QueueStats>, JoinHandle<Result<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(QueueStats::default());
    let task_stats = stats.clone();

    let task = tokio::spawn(async move {
        let mut reader = FrameReader::new(source, width, height, format);
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = reader.next_frame() => frame?,
            };
            let Some(frame) = frame else { break };

            match tx.try_send(frame) {
                Ok(()) => {
                    task_stats.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = task_stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped == 1 || dropped % 100 == 0 {
                        debug!("Frame queue full, dropped {} frames so far", dropped);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        debug!("Frame reader stopped after {} frames", reader.frames_read());
        Ok(())
    });

    (rx, stats, task)
}

/// Cancel `token` on Ctrl-C or SIGTERM.
pub fn spawn_shutdown_listener(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => {
                info!("Shutdown signal received");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Log a metrics snapshot every `period` until cancelled.
pub fn spawn_metrics_logger(
    role: &'static str,
    metrics: Arc<LatencyMetrics>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = metrics.snapshot();
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => debug!("[{}] Latency metrics: {}", role, json),
                        Err(e) => debug!("[{}] Failed to encode metrics: {}", role, e),
                    }
                }
            }
        }
    })
}

/// Stop a helper task, waiting at most `grace` for it.
pub(crate) async fn join_task<T>(name: &str, task: JoinHandle<T>, grace: Duration) -> Option<T> {
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("{} task failed: {}", name, e);
            None
        }
        Err(_) => {
            debug!("{} task did not finish within {:?}", name, grace);
            None
        }
    }
}
