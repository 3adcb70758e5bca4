//! The rendering surface the engine drives.
//!
//! A sink accepts either a URL it fetches and decodes itself (progressive
//! playback) or a stream of media chunks pushed by a segmented adapter. It
//! reports its lifecycle through [`SinkEvent`]s on a broadcast channel. Every
//! attach and detach starts a new source id, and each event carries the id
//! it was raised under so listeners can drop leftovers of a replaced source.

mod headless;

pub use headless::HeadlessSink;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::Serialize;
use tokio::sync::broadcast;
use url::Url;

use crate::error::SinkError;

/// What the sink should play.
#[derive(Debug, Clone)]
pub enum SinkSource {
    /// The sink fetches and decodes the resource itself.
    Url { url: Url, headers: HeaderMap },
    /// The engine pushes chunks with [`MediaSink::append`].
    Segments {
        live: bool,
        /// Presentation duration in seconds, when known
        duration: Option<f64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Initialization data (e.g. an fMP4 `moov`), carries no media time
    Init,
    Media,
}

/// One piece of media pushed into the sink.
#[derive(Debug, Clone)]
pub struct MediaChunk {
    /// Quality level the chunk belongs to
    pub level: usize,
    pub kind: ChunkKind,
    /// Presentation start in seconds
    pub start: f64,
    /// Duration in seconds, 0 for init chunks
    pub duration: f64,
    pub data: Bytes,
}

/// A buffered interval in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }
}

/// Frame counters reported by the sink's decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackQuality {
    pub dropped_frames: u64,
    pub total_frames: u64,
}

/// Size of a surface in physical terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
    /// Device pixel ratio
    pub pixel_ratio: f64,
}

impl SurfaceSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixel_ratio: 1.0,
        }
    }
}

/// Lifecycle signals emitted by a sink.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    LoadStart,
    LoadedMetadata {
        width: u32,
        height: u32,
        duration: Option<f64>,
    },
    CanPlay,
    Playing,
    Pause,
    Waiting,
    Seeking,
    Seeked,
    Ended,
    TimeUpdate,
    Progress,
    Error {
        code: u16,
        message: String,
    },
}

/// A [`SinkEvent`] tagged with the source it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkNotice {
    /// [`MediaSink::source_id`] at the time the event was raised
    pub source: u64,
    pub event: SinkEvent,
}

#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Replace the current source and return its id. Buffered media is
    /// discarded.
    fn attach(&self, source: SinkSource) -> Result<u64, SinkError>;

    /// Drop the source and everything buffered.
    fn detach(&self);

    /// Id of the current source. Changes on every attach and detach.
    fn source_id(&self) -> u64;

    fn append(&self, chunk: MediaChunk) -> Result<(), SinkError>;

    /// No more chunks will follow for the current source.
    fn end_of_stream(&self);

    async fn play(&self) -> Result<(), SinkError>;

    fn pause(&self);

    fn is_paused(&self) -> bool;

    fn current_time(&self) -> f64;

    fn set_current_time(&self, seconds: f64);

    /// `None` until known; infinite for live sources.
    fn duration(&self) -> Option<f64>;

    /// Buffered ranges, sorted and non-overlapping.
    fn buffered(&self) -> Vec<TimeRange>;

    fn set_volume(&self, volume: f64);

    fn set_muted(&self, muted: bool);

    fn set_playback_rate(&self, rate: f64);

    fn playback_quality(&self) -> PlaybackQuality {
        PlaybackQuality::default()
    }

    /// Size of the render surface, if the sink has one.
    fn surface_size(&self) -> Option<SurfaceSize> {
        None
    }

    fn subscribe(&self) -> broadcast::Receiver<SinkNotice>;
}
