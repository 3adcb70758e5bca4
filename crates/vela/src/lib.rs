//! Vela: an adaptive streaming playback engine.
//!
//! The engine loads HLS, DASH or progressive sources into a [`MediaSink`],
//! keeps the buffer filled, picks quality levels from measured throughput
//! and recovers from network and decode failures on its own.

pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod protocol;
pub mod quality;
pub mod recovery;
pub mod retry;
pub mod sink;
pub mod state;

pub use buffer::{BufferInfo, BufferMonitor};
pub use config::{
    AbrConfig, BufferConfig, EngineConfig, HttpConfig, LoaderConfig, ProtocolHint, StreamConfig,
};
pub use engine::Engine;
pub use error::{AdapterError, EngineError, SinkError, codes};
pub use events::{EngineEvent, EventBus, EventKind, ListenerId, Subscription};
pub use protocol::Protocol;
pub use quality::{QualityController, QualityLevel};
pub use recovery::{ErrorClass, RecoveryAction, RecoveryKind, RecoveryPlanner, RecoveryPolicy};
pub use retry::RetryPolicy;
pub use sink::{HeadlessSink, MediaSink, SinkEvent, SinkNotice, SinkSource};
pub use state::{EngineStats, PlaybackState};
