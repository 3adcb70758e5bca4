use thiserror::Error;
use vela_engine::EngineError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Playback failed: {0}")]
    PlaybackFailed(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
