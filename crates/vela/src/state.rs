use serde::Serialize;
use strum::Display;

use crate::buffer::BufferInfo;
use crate::quality::QualityLevel;

/// Playback state owned by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Buffering,
    Playing,
    Paused,
    Seeking,
    Ended,
    Error,
}

/// Snapshot taken on every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub current_time: f64,
    pub duration: f64,
    pub buffer: BufferInfo,
    /// Bitrate of the active level in bits per second
    pub bitrate: u64,
    pub dropped_frames: u64,
    /// Distance from the live edge in seconds, 0 for on-demand content
    pub latency: f64,
    /// Weighted download speed in bits per second
    pub download_speed: f64,
    pub quality: Option<QualityLevel>,
    pub state: PlaybackState,
}
