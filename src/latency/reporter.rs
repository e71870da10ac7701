//! Rolling latency aggregate for the overlay and the logs.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::warn;

use super::LatencySample;

/// Latest view of the measured latency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub latest_ms: Option<f64>,
    /// Mean over the rolling window
    pub average_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    /// Samples seen since start
    pub samples: u64,
    /// Displayed frames per second
    pub fps: f64,
}

/// Colour grade of the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyLevel {
    NoData,
    Good,
    Degraded,
    Poor,
}

impl LatencyLevel {
    pub const DEGRADED_MS: f64 = 100.0;
    pub const POOR_MS: f64 = 250.0;

    pub fn from_ms(latency_ms: Option<f64>) -> Self {
        match latency_ms {
            None => LatencyLevel::NoData,
            Some(ms) if ms < Self::DEGRADED_MS => LatencyLevel::Good,
            Some(ms) if ms < Self::POOR_MS => LatencyLevel::Degraded,
            Some(_) => LatencyLevel::Poor,
        }
    }

    /// ffmpeg colour name for drawtext
    pub fn color(&self) -> &'static str {
        match self {
            LatencyLevel::NoData => "white",
            LatencyLevel::Good => "green",
            LatencyLevel::Degraded => "orange",
            LatencyLevel::Poor => "red",
        }
    }

    /// Same grade as an (R, G, B) triple, for painting into frames
    pub fn rgb(&self) -> (u8, u8, u8) {
        match self {
            LatencyLevel::NoData => (255, 255, 255),
            LatencyLevel::Good => (0, 200, 0),
            LatencyLevel::Degraded => (255, 165, 0),
            LatencyLevel::Poor => (255, 0, 0),
        }
    }
}

impl LatencySnapshot {
    pub fn level(&self) -> LatencyLevel {
        LatencyLevel::from_ms(self.average_ms)
    }

    /// Two-line overlay text.
    pub fn overlay_text(&self) -> String {
        let latency = match (self.latest_ms, self.average_ms) {
            (Some(latest), Some(avg)) => format!("Latency: {:.1} ms (avg {:.1})", latest, avg),
            _ => "Latency: --".to_string(),
        };
        format!("FPS: {:.1}\n{}", self.fps, latency)
    }
}

/// Keeps the last `window` samples and publishes a [`LatencySnapshot`] after
/// every update. Publishing overwrites the previous value and never waits for
/// readers.
#[derive(Debug)]
pub struct LatencyReporter {
    window: VecDeque<f64>,
    capacity: usize,
    total: u64,
    fps: f64,
    skew_warned: bool,
    tx: watch::Sender<LatencySnapshot>,
}

impl LatencyReporter {
    pub fn new(window: usize) -> Self {
        let capacity = window.max(1);
        let (tx, _) = watch::channel(LatencySnapshot::default());
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
            fps: 0.0,
            skew_warned: false,
            tx,
        }
    }

    /// Readers get the most recent snapshot; intermediate ones may be skipped.
    pub fn subscribe(&self) -> watch::Receiver<LatencySnapshot> {
        self.tx.subscribe()
    }

    pub fn record(&mut self, sample: &LatencySample) {
        let ms = sample.latency_ms();
        if ms < 0.0 && !self.skew_warned {
            warn!(
                "Negative latency ({:.1} ms) for frame {}: sender and receiver clocks are not in sync",
                ms, sample.sequence_id
            );
            self.skew_warned = true;
        }

        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(ms);
        self.total += 1;
        self.publish();
    }

    pub fn set_fps(&mut self, fps: f64) {
        self.fps = fps;
        self.publish();
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let count = self.window.len();
        let (average_ms, min_ms, max_ms) = if count == 0 {
            (None, None, None)
        } else {
            let sum: f64 = self.window.iter().sum();
            let min = self.window.iter().copied().fold(f64::INFINITY, f64::min);
            let max = self.window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (Some(sum / count as f64), Some(min), Some(max))
        };
        LatencySnapshot {
            latest_ms: self.window.back().copied(),
            average_ms,
            min_ms,
            max_ms,
            samples: self.total,
            fps: self.fps,
        }
    }

    fn publish(&self) {
        self.tx.send_replace(self.snapshot());
    }
}

/// Frames-per-second meter, recomputed once per interval.
#[derive(Debug)]
pub struct FpsCounter {
    interval: Duration,
    frames: u32,
    since: Instant,
    fps: f64,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1), Instant::now())
    }

    pub fn with_interval(interval: Duration, start: Instant) -> Self {
        Self { interval, frames: 0, since: start, fps: 0.0 }
    }

    /// Count one frame at `now`. Returns the new rate when the interval rolled over.
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.since);
        if elapsed < self.interval {
            return None;
        }
        self.fps = self.frames as f64 / elapsed.as_secs_f64();
        self.frames = 0;
        self.since = now;
        Some(self.fps)
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}
