//! Stream recorder.
//!
//! One ffmpeg process copies the incoming MPEG-TS into an MP4 file and, when
//! latency measurement is on, also decodes it to raw frames for the probe.
//! Matched samples are appended to a JSON-lines file next to the recording.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Params;
use crate::error::{Result, StreamError};
use crate::ffmpeg::{self, ManagedProcess, PIPE_FORMAT};
use crate::latency::{FrameOutcome, LatencyProbe, LatencySample, LatencySnapshot};
use crate::metrics::{LatencyMetrics, MetricsSnapshot};
use crate::side_channel::TimestampSubscriber;
use crate::video::RawFrame;

use super::{
    join_task, spawn_frame_reader, spawn_metrics_logger, FRAME_QUEUE_CAPACITY,
    RECORDER_STOP_GRACE, VIEWER_STOP_GRACE,
};

const PROGRESS_PERIOD: Duration = Duration::from_secs(10);

/// Smaller files are reported as empty recordings.
pub const MIN_RECORDING_BYTES: u64 = 1024;

#[derive(Debug, Clone, Default)]
pub struct RecorderOptions {
    /// Overrides `recorder.output_dir`
    pub output_dir: Option<PathBuf>,
}

/// Where one recording run writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingPaths {
    pub video: PathBuf,
    pub samples: PathBuf,
}

impl RecordingPaths {
    pub fn new(dir: &Path, started: DateTime<Local>) -> Self {
        let stamp = started.format("%Y%m%d_%H%M%S");
        Self {
            video: dir.join(format!("recording_{}.mp4", stamp)),
            samples: dir.join(format!("latency_{}.jsonl", stamp)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingReport {
    pub paths: RecordingPaths,
    pub duration: Duration,
    pub bytes: u64,
    pub latency: LatencySnapshot,
    pub metrics: MetricsSnapshot,
}

impl RecordingReport {
    /// Whether anything beyond container headers was written.
    pub fn has_data(&self) -> bool {
        self.bytes > MIN_RECORDING_BYTES
    }
}

/// Appends one JSON object per latency sample.
pub struct SampleLog {
    writer: BufWriter<File>,
    written: u64,
}

impl SampleLog {
    pub async fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .await
            .map_err(|e| StreamError::frame_io(format!("creating {}", path.display()), e))?;
        Ok(Self { writer: BufWriter::new(file), written: 0 })
    }

    pub async fn append(&mut self, sample: &LatencySample) -> Result<()> {
        let mut line = serde_json::to_vec(sample)
            .map_err(|e| StreamError::frame_io("encoding latency sample", e.into()))?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| StreamError::frame_io("writing latency sample", e))?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn close(mut self) -> Result<()> {
        self.writer
            .shutdown()
            .await
            .map_err(|e| StreamError::frame_io("closing latency log", e))
    }
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

pub async fn run_recorder(
    params: &Params,
    options: &RecorderOptions,
    cancel: CancellationToken,
) -> Result<RecordingReport> {
    let video = &params.video;
    let network = &params.network;
    let output_dir = options
        .output_dir
        .clone()
        .unwrap_or_else(|| params.recorder.output_dir.clone());
    tokio::fs::create_dir_all(&output_dir)
        .await
        .map_err(|e| StreamError::frame_io(format!("creating {}", output_dir.display()), e))?;

    let started_at = Local::now();
    let started = Instant::now();
    let paths = RecordingPaths::new(&output_dir, started_at);
    info!("[Recorder] Recording to {}", paths.video.display());

    let metrics = Arc::new(LatencyMetrics::new());
    let mut probe = params
        .latency
        .enabled
        .then(|| LatencyProbe::new(&params.latency, video.framerate, metrics.clone()));

    let side_cancel = cancel.child_token();
    let subscriber = match &probe {
        Some(probe) => Some(
            TimestampSubscriber::start(
                network.recorder_timestamp_bind(),
                probe.table(),
                metrics.clone(),
                side_cancel.clone(),
            )
            .await?,
        ),
        None => None,
    };
    let mut samples = match &probe {
        Some(_) => Some(SampleLog::create(&paths.samples).await?),
        None => None,
    };

    let video_bind = SocketAddr::new(network.listen_ip, network.recorder_video_port());
    let command = ffmpeg::recorder_command(video, video_bind, &paths.video, probe.is_some());
    info!("[Recorder] Listening for video on {}", video_bind);
    debug!("[Recorder] {}", command);
    let stdout = if probe.is_some() { Stdio::piped() } else { Stdio::null() };
    let mut recorder = ManagedProcess::spawn("recorder", &command, Stdio::piped(), stdout)?;

    let reader_cancel = cancel.child_token();
    let mut frames = None;
    let mut reader = None;
    if probe.is_some() {
        let (rx, _stats, task) = spawn_frame_reader(
            recorder.take_stdout()?,
            video.width,
            video.height,
            PIPE_FORMAT,
            FRAME_QUEUE_CAPACITY,
            reader_cancel.clone(),
        );
        frames = Some(rx);
        reader = Some(task);
    }

    let logger = spawn_metrics_logger("Recorder", metrics.clone(), PROGRESS_PERIOD, cancel.clone());
    let mut progress = tokio::time::interval(PROGRESS_PERIOD);
    progress.tick().await;
    let mut result = Ok(());

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            status = recorder.wait() => Event::Exited(status),
            _ = progress.tick() => Event::Progress,
            frame = next_frame(&mut frames) => Event::Frame(frame),
        };

        let next = match event {
            Event::Frame(frame) => frame,
            Event::Progress => {
                info!(
                    "[Recorder] Recording for {:.0}s, {} KiB written",
                    started.elapsed().as_secs_f64(),
                    file_size(&paths.video).await / 1024
                );
                continue;
            }
            Event::Exited(Ok(status)) => {
                warn!("[Recorder] ffmpeg exited unexpectedly ({})", status);
                result = Err(recorder.exited_error(status));
                break;
            }
            Event::Exited(Err(e)) => {
                result = Err(e);
                break;
            }
        };

        let Some(frame) = next else {
            // Probe output closed; keep recording without it
            debug!("[Recorder] Probe stream ended");
            frames = None;
            continue;
        };

        if let Some(probe) = probe.as_mut() {
            if let FrameOutcome::Matched(sample) = probe.on_frame(&frame) {
                if let Some(log) = samples.as_mut() {
                    if let Err(e) = log.append(&sample).await {
                        warn!("[Recorder] Latency log disabled: {}", e);
                        samples = None;
                    }
                }
            }
        }
    }

    reader_cancel.cancel();
    recorder.stop(RECORDER_STOP_GRACE).await;
    drop(frames);
    if let Some(task) = reader {
        if let Some(Err(e)) = join_task("frame reader", task, VIEWER_STOP_GRACE).await {
            debug!("[Recorder] Frame reader ended with: {}", e);
        }
    }
    side_cancel.cancel();
    if let Some(subscriber) = subscriber {
        subscriber.join().await;
    }
    if let Some(log) = samples {
        let written = log.written();
        if let Err(e) = log.close().await {
            warn!("[Recorder] {}", e);
        } else {
            info!("[Recorder] {} latency samples in {}", written, paths.samples.display());
        }
    }
    logger.abort();

    let report = RecordingReport {
        bytes: file_size(&paths.video).await,
        duration: started.elapsed(),
        latency: probe.as_ref().map(|p| p.reporter().snapshot()).unwrap_or_default(),
        metrics: metrics.snapshot(),
        paths,
    };
    info!("[Recorder] Recording stopped. Duration: {:.2} seconds", report.duration.as_secs_f64());
    if report.has_data() {
        info!("[Recorder] ✅ Output file: {} ({} KiB)", report.paths.video.display(), report.bytes / 1024);
    } else {
        warn!("[Recorder] No data was recorded. Make sure a stream is active on port {}", video_bind.port());
    }
    result.map(|_| report)
}

enum Event {
    Frame(Option<RawFrame>),
    Progress,
    Exited(Result<std::process::ExitStatus>),
}

/// Next probe frame; pending forever once the probe stream is gone.
async fn next_frame(frames: &mut Option<tokio::sync::mpsc::Receiver<RawFrame>>) -> Option<RawFrame> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
