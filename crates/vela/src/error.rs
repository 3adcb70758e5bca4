use std::fmt;
use std::sync::Arc;

use reqwest::StatusCode;
use strum::Display;

/// Well-known engine error codes.
///
/// Adapter codes are built from [`Namespace`] and [`Stage`], e.g.
/// `HLS_FRAG_LOAD_ERROR` or `DASH_MANIFEST_PARSE_ERROR`.
pub mod codes {
    pub const LOAD_ERROR: &str = "LOAD_ERROR";
    pub const PLAY_ERROR: &str = "PLAY_ERROR";
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
    pub const ENGINE_DESTROYED: &str = "ENGINE_DESTROYED";
    pub const BUFFER_STALLED_ERROR: &str = "BUFFER_STALLED_ERROR";

    /// Code for an error reported by the media sink itself.
    pub fn media_error(code: u16) -> String {
        format!("MEDIA_ERROR_{code}")
    }
}

/// An error raised anywhere in the engine and forwarded to callers.
///
/// Only errors with `fatal` set move the engine into the error state and
/// drive automatic recovery.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub code: String,
    pub message: String,
    pub fatal: bool,
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl EngineError {
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            fatal: true,
            cause: None,
        }
    }

    pub fn non_fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            fatal: false,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Error code prefix identifying which adapter raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Namespace {
    Hls,
    Dash,
    Direct,
}

/// The kind of resource an adapter was working on when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Stage {
    Manifest,
    Level,
    Frag,
    Media,
}

/// Failures reported by a media sink.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("operation aborted")]
    Aborted,

    #[error("playback not allowed: {reason}")]
    NotAllowed { reason: String },

    #[error("sink buffer is full")]
    QuotaExceeded,

    #[error("no source attached")]
    NoSource,

    #[error("sink error: {reason}")]
    Other { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("request timed out: {url}")]
    Timeout { url: String },

    #[error("manifest error: {reason}")]
    Manifest { reason: String },

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("no metadata received within {0:?}")]
    MetadataTimeout(std::time::Duration),

    #[error("unsupported content: {reason}")]
    Unsupported { reason: String },
}

impl AdapterError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::Manifest {
            reason: reason.into(),
        }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    /// Maps a reqwest failure, keeping timeouts distinguishable.
    pub fn from_reqwest(err: reqwest::Error, url: &url::Url) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Network { source: err }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::Manifest { .. }
            | Self::Unsupported { .. }
            | Self::MetadataTimeout(_) => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Sink(err) => matches!(err, SinkError::QuotaExceeded),
            Self::Network { .. } | Self::Timeout { .. } => true,
        }
    }

    /// Namespaced error code for this failure, e.g. `HLS_FRAG_LOAD_ERROR`.
    pub fn code(&self, namespace: Namespace, stage: Stage) -> String {
        match self {
            Self::Timeout { .. } | Self::MetadataTimeout(_) => {
                format!("{namespace}_{stage}_LOAD_TIMEOUT")
            }
            Self::Network { .. } => format!("{namespace}_{stage}_NETWORK_ERROR"),
            Self::Manifest { .. } => format!("{namespace}_{stage}_PARSE_ERROR"),
            Self::Sink(_) => format!("{namespace}_BUFFER_APPEND_ERROR"),
            Self::Cancelled => format!("{namespace}_CANCELLED"),
            Self::InvalidUrl { .. } | Self::HttpStatus { .. } | Self::Unsupported { .. } => {
                format!("{namespace}_{stage}_LOAD_ERROR")
            }
        }
    }

    pub fn into_engine_error(self, namespace: Namespace, stage: Stage, fatal: bool) -> EngineError {
        let code = self.code(namespace, stage);
        let message = self.to_string();
        let err = if fatal {
            EngineError::fatal(code, message)
        } else {
            EngineError::non_fatal(code, message)
        };
        err.with_cause(self)
    }
}
