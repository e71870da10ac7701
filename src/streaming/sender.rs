//! Robot-side streamer.
//!
//! With tagging: `capture ffmpeg -> rawvideo -> Tagger -> encoder ffmpeg`,
//! plus one timestamp record per frame on the side-channel. Without: a single
//! ffmpeg process straight from the camera to the network.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CorrelationMode, Params};
use crate::error::Result;
use crate::ffmpeg::{self, ManagedProcess, PIPE_FORMAT};
use crate::latency::{Session, TagEncoding, TagGenerator, Tagger};
use crate::metrics::{LatencyMetrics, MetricsSnapshot};
use crate::platform::CaptureBackend;
use crate::side_channel::UdpPublisher;
use crate::video::{FrameReader, FrameWriter};

use super::{spawn_metrics_logger, VIEWER_STOP_GRACE};

const METRICS_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct SenderOptions {
    /// Skip tagging and run the single direct ffmpeg pipeline
    pub no_tag: bool,
}

#[derive(Debug, Clone)]
pub struct SenderReport {
    pub tagged: bool,
    pub frames: u64,
    pub uptime: Duration,
    pub metrics: MetricsSnapshot,
}

/// How the sender marks frames for a given receiver correlation mode.
pub fn tag_encoding(mode: CorrelationMode) -> TagEncoding {
    match mode {
        CorrelationMode::Barcode => TagEncoding::Barcode,
        CorrelationMode::ArrivalOrder => TagEncoding::ArrivalIndex,
    }
}

/// Whether the run skips tagging and uses the single direct pipeline.
pub fn streams_directly(params: &Params, options: &SenderOptions) -> bool {
    options.no_tag || !params.latency.enabled
}

pub async fn run_sender(
    params: &Params,
    options: &SenderOptions,
    cancel: CancellationToken,
) -> Result<SenderReport> {
    let backend = CaptureBackend::resolve(&params.video);
    info!(
        "[Robot] Camera {} via {} at {}x{} @ {} fps",
        backend.device, backend.input_format, params.video.width, params.video.height, params.video.framerate
    );

    if streams_directly(params, options) {
        info!("[Robot] Frame tagging disabled, streaming directly");
        run_direct(params, &backend, cancel).await
    } else {
        run_tagged(params, &backend, cancel).await
    }
}

async fn run_direct(
    params: &Params,
    backend: &CaptureBackend,
    cancel: CancellationToken,
) -> Result<SenderReport> {
    let started = Instant::now();
    let command = ffmpeg::direct_stream_command(backend, &params.video, &params.network);
    info!("[Robot] {}", command);
    let mut stream = ManagedProcess::spawn("stream", &command, Stdio::piped(), Stdio::null())?;

    let exited = tokio::select! {
        _ = cancel.cancelled() => None,
        status = stream.wait() => Some(status?),
    };

    let report = SenderReport {
        tagged: false,
        frames: 0,
        uptime: started.elapsed(),
        metrics: MetricsSnapshot::default(),
    };
    match exited {
        Some(status) => Err(stream.exited_error(status)),
        None => {
            stream.stop(VIEWER_STOP_GRACE).await;
            Ok(report)
        }
    }
}

async fn run_tagged(
    params: &Params,
    backend: &CaptureBackend,
    cancel: CancellationToken,
) -> Result<SenderReport> {
    let video = &params.video;
    let started = Instant::now();
    let metrics = Arc::new(LatencyMetrics::new());

    let publisher = UdpPublisher::start(
        params.network.timestamp_targets(),
        params.latency.queue_capacity,
        metrics.clone(),
    )
    .await?;

    let encoding = tag_encoding(params.latency.correlation);
    let session = Session::start();
    info!("[Robot] Session {} ({:?} tags)", session.id(), encoding);
    let mut tagger = Tagger::new(
        TagGenerator::new(session, encoding),
        publisher,
        params.latency.cell_size,
        metrics.clone(),
    );

    let encode_cmd = ffmpeg::encode_command(video, &params.network);
    info!("[Robot] {}", encode_cmd);
    let mut encoder = ManagedProcess::spawn("encoder", &encode_cmd, Stdio::piped(), Stdio::null())?;

    let capture_cmd = ffmpeg::capture_command(backend, video);
    debug!("[Robot] {}", capture_cmd);
    let mut capture = ManagedProcess::spawn("capture", &capture_cmd, Stdio::null(), Stdio::piped())?;

    let mut reader = FrameReader::new(capture.take_stdout()?, video.width, video.height, PIPE_FORMAT);
    let mut writer = FrameWriter::new(encoder.take_stdin()?);

    let logger = spawn_metrics_logger("Robot", metrics.clone(), METRICS_PERIOD, cancel.clone());
    let mut result = Ok(());

    loop {
        // A frame cut short by cancellation is discarded with the pipe
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next_frame() => next,
        };

        let mut frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                warn!("[Robot] Camera stream ended");
                if let Ok(Some(status)) = capture.try_wait() {
                    result = Err(capture.exited_error(status));
                }
                break;
            }
            Err(e) => {
                result = Err(e);
                break;
            }
        };

        let tag = tagger.tag_frame(&mut frame);
        if let Err(e) = writer.write_frame(&frame).await {
            warn!("[Robot] Encoder stopped accepting frames: {}", e);
            result = match encoder.try_wait() {
                Ok(Some(status)) => Err(encoder.exited_error(status)),
                _ => Err(e),
            };
            break;
        }

        if tag.sequence_id == 0 {
            info!("[Robot] ✅ First frame tagged and streaming");
        }
    }

    let frames = writer.frames_written();
    if let Err(e) = writer.finish().await {
        debug!("[Robot] Encoder pipe already closed: {}", e);
    }
    capture.stop(VIEWER_STOP_GRACE).await;
    encoder.stop(VIEWER_STOP_GRACE).await;
    tagger.into_sink().shutdown().await;
    logger.abort();

    let report = SenderReport {
        tagged: true,
        frames,
        uptime: started.elapsed(),
        metrics: metrics.snapshot(),
    };
    info!(
        "[Robot] Streamed {} frames in {:.1}s, {} timestamps sent, {} dropped",
        report.frames,
        report.uptime.as_secs_f64(),
        report.metrics.tags_emitted,
        report.metrics.samples_dropped
    );
    result.map(|_| report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_follows_correlation_mode() {
        assert_eq!(tag_encoding(CorrelationMode::Barcode), TagEncoding::Barcode);
        assert_eq!(tag_encoding(CorrelationMode::ArrivalOrder), TagEncoding::ArrivalIndex);
    }

    #[test]
    fn direct_pipeline_when_tagging_is_off() {
        let mut params = Params::default();
        let tag = SenderOptions::default();
        let no_tag = SenderOptions { no_tag: true };

        assert!(!streams_directly(&params, &tag));
        assert!(streams_directly(&params, &no_tag));

        params.latency.enabled = false;
        assert!(streams_directly(&params, &tag));
    }
}
