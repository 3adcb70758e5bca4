use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::BufferConfig;
use crate::sink::{MediaSink, TimeRange};

/// Tolerance when deciding whether the play position lies inside a range.
const LOCATE_TOLERANCE: f64 = 0.1;

/// The buffered range around the play position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BufferInfo {
    pub start: f64,
    pub end: f64,
    /// Seconds buffered ahead of the play position
    pub ahead: f64,
}

impl BufferInfo {
    pub fn length(&self) -> f64 {
        self.end - self.start
    }

    /// Find the range containing `position`, or else the nearest one ahead.
    pub fn locate(ranges: &[TimeRange], position: f64, tolerance: f64) -> Self {
        if let Some(range) = ranges
            .iter()
            .find(|r| position >= r.start - tolerance && position <= r.end + tolerance)
        {
            return Self {
                start: range.start,
                end: range.end,
                ahead: (range.end - position).max(0.0),
            };
        }

        ranges
            .iter()
            .filter(|r| r.start > position)
            .min_by(|a, b| a.start.total_cmp(&b.start))
            .map_or(
                Self {
                    start: position,
                    end: position,
                    ahead: 0.0,
                },
                |next| Self {
                    start: next.start,
                    end: next.end,
                    ahead: 0.0,
                },
            )
    }
}

/// Watches the sink buffer and estimates network throughput.
pub struct BufferMonitor {
    sink: Arc<dyn MediaSink>,
    config: BufferConfig,
    low_latency: bool,
    /// Download speeds in bits per second, oldest first
    samples: VecDeque<f64>,
}

impl BufferMonitor {
    pub fn new(sink: Arc<dyn MediaSink>, config: BufferConfig) -> Self {
        let capacity = config.speed_samples.max(1);
        Self {
            low_latency: config.low_latency_mode,
            sink,
            config,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn set_low_latency(&mut self, enabled: bool) {
        self.low_latency = enabled;
    }

    pub fn is_low_latency(&self) -> bool {
        self.low_latency
    }

    pub fn buffer_info(&self) -> BufferInfo {
        BufferInfo::locate(
            &self.sink.buffered(),
            self.sink.current_time(),
            LOCATE_TOLERANCE,
        )
    }

    /// Buffered-ahead seconds relative to the target window, in `0..=1`.
    pub fn buffer_health(&self) -> f64 {
        let target = if self.low_latency {
            self.config.target_latency
        } else {
            self.config.max_buffer_length / 2.0
        };
        if target <= 0.0 {
            return 1.0;
        }
        (self.buffer_info().ahead / target).clamp(0.0, 1.0)
    }

    pub fn should_start_buffering(&self) -> bool {
        self.buffer_info().ahead < self.config.min_buffer_length
    }

    pub fn is_buffer_healthy(&self) -> bool {
        self.buffer_info().ahead >= self.config.start_buffer_length
    }

    pub fn record_fragment_load(&mut self, bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        if self.samples.len() >= self.config.speed_samples.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(bytes as f64 * 8.0 / secs);
    }

    pub fn has_estimate(&self) -> bool {
        !self.samples.is_empty()
    }

    /// Weighted moving average in bits per second; newer samples weigh more.
    pub fn average_download_speed(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let (sum, weights) = self
            .samples
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(sum, weights), (i, speed)| {
                let weight = (i + 1) as f64;
                (sum + speed * weight, weights + weight)
            });
        sum / weights
    }

    /// Sustainable bitrate, `None` until the first fragment was measured.
    pub fn optimal_bitrate(&self) -> Option<f64> {
        self.has_estimate()
            .then(|| self.average_download_speed() * self.config.safety_factor)
    }

    /// Drop all speed samples.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
