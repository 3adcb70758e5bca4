use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use strum::{Display, EnumString};

use crate::error::{EngineError, codes};
use crate::recovery::RecoveryPolicy;
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "IPTV Smarters Pro";

/// Buffer sizing and bandwidth estimation
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Seconds of media to keep buffered ahead of the play position
    pub max_buffer_length: f64,
    /// Below this many seconds ahead the engine considers itself starving
    pub min_buffer_length: f64,
    /// Seconds ahead required before playback is considered healthy
    pub start_buffer_length: f64,
    /// Target distance from the live edge in low-latency mode
    pub target_latency: f64,
    /// Default low-latency mode when a stream does not specify one
    pub low_latency_mode: bool,
    /// Number of download speed samples kept for the moving average
    pub speed_samples: usize,
    /// Fraction of the measured bandwidth considered sustainable
    pub safety_factor: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_length: 30.0,
            min_buffer_length: 2.0,
            start_buffer_length: 0.5,
            target_latency: 3.0,
            low_latency_mode: false,
            speed_samples: 10,
            safety_factor: 0.7,
        }
    }
}

/// Adaptive bitrate behaviour
#[derive(Debug, Clone)]
pub struct AbrConfig {
    /// Start in automatic quality mode
    pub auto_quality: bool,
    /// Level to start with; `None` lets the adapter pick the lowest level
    pub start_level: Option<usize>,
    /// Never pick a level much larger than the render surface
    pub cap_level_to_surface: bool,
    /// Minimum time between two automatic switches
    pub min_switch_interval: Duration,
    /// Buffer health under which upgrades are refused
    pub starved_threshold: f64,
    /// Headroom applied to the surface size when capping levels
    pub surface_headroom: f64,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            auto_quality: true,
            start_level: None,
            cap_level_to_surface: true,
            min_switch_interval: Duration::from_secs(5),
            starved_threshold: 0.5,
            surface_headroom: 1.2,
        }
    }
}

/// Manifest and fragment loading
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Retry policy for media and init fragments
    pub fragment_retry: RetryPolicy,
    /// Retry policy for manifests and variant playlists
    pub manifest_retry: RetryPolicy,
    /// How long a direct source may take to report metadata
    pub metadata_timeout: Duration,
    /// Live start offset from the edge, in target durations
    pub live_sync_duration_count: u32,
    /// Lower bound for live manifest refreshes
    pub min_refresh_interval: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            fragment_retry: RetryPolicy::fragments(),
            manifest_retry: RetryPolicy::manifests(),
            metadata_timeout: Duration::from_secs(15),
            live_sync_duration_count: 3,
            min_refresh_interval: Duration::from_millis(500),
        }
    }
}

/// HTTP client settings shared by all adapters
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// User agent string
    pub user_agent: String,
    /// Overall timeout for a single request
    pub timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Headers sent with every request
    pub headers: HeaderMap,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            headers: HeaderMap::new(),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub buffer: BufferConfig,
    pub abr: AbrConfig,
    pub recovery: RecoveryPolicy,
    pub loader: LoaderConfig,
    pub http: HttpConfig,
    /// Interval of the stats and quality evaluation tick
    pub tick_interval: Duration,
    /// Raise a stall error after buffering with an empty buffer this long
    pub stall_timeout: Option<Duration>,
    /// Seconds skipped forward by a seek-past recovery
    pub seek_past_offset: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            abr: AbrConfig::default(),
            recovery: RecoveryPolicy::default(),
            loader: LoaderConfig::default(),
            http: HttpConfig::default(),
            tick_interval: Duration::from_secs(1),
            stall_timeout: None,
            seek_past_offset: 1.0,
        }
    }
}

impl EngineConfig {
    pub fn with_buffer(mut self, buffer: BufferConfig) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_abr(mut self, abr: AbrConfig) -> Self {
        self.abr = abr;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_http(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: String| EngineError::non_fatal(codes::CONFIG_ERROR, reason);

        let b = &self.buffer;
        if !(b.max_buffer_length > 0.0 && b.max_buffer_length.is_finite()) {
            return Err(invalid(format!(
                "max_buffer_length must be positive, got {}",
                b.max_buffer_length
            )));
        }
        if b.min_buffer_length < 0.0 || b.min_buffer_length > b.max_buffer_length {
            return Err(invalid(format!(
                "min_buffer_length must be within 0..={}, got {}",
                b.max_buffer_length, b.min_buffer_length
            )));
        }
        if b.target_latency <= 0.0 {
            return Err(invalid("target_latency must be positive".to_string()));
        }
        if b.speed_samples == 0 {
            return Err(invalid("speed_samples must be at least 1".to_string()));
        }
        if !(b.safety_factor > 0.0 && b.safety_factor <= 1.0) {
            return Err(invalid(format!(
                "safety_factor must be within (0, 1], got {}",
                b.safety_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.abr.starved_threshold) {
            return Err(invalid("starved_threshold must be within 0..=1".to_string()));
        }
        if self.abr.surface_headroom < 1.0 {
            return Err(invalid("surface_headroom must be >= 1".to_string()));
        }
        if self.tick_interval.is_zero() {
            return Err(invalid("tick_interval must be non-zero".to_string()));
        }
        if self.seek_past_offset < 0.0 {
            return Err(invalid("seek_past_offset must not be negative".to_string()));
        }
        self.recovery.validate().map_err(invalid)?;
        Ok(())
    }
}

/// Which adapter to use for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProtocolHint {
    /// Sniff the URL
    #[default]
    Auto,
    /// Segmented manifest streaming (HLS)
    #[strum(to_string = "segmented", serialize = "hls")]
    Segmented,
    /// Dynamic manifest streaming (DASH)
    #[strum(to_string = "dynamic", serialize = "dash")]
    Dynamic,
    /// Progressive or direct file playback
    #[strum(to_string = "direct", serialize = "progressive")]
    Direct,
}

/// Input to a single load.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub url: String,
    pub protocol: ProtocolHint,
    /// Position to start from, in seconds
    pub start_position: Option<f64>,
    /// Overrides [`BufferConfig::low_latency_mode`] for this stream
    pub low_latency_mode: Option<bool>,
    /// Extra headers sent with every request for this stream
    pub headers: HashMap<String, String>,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: ProtocolHint) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_start_position(mut self, seconds: f64) -> Self {
        self.start_position = Some(seconds);
        self
    }

    pub fn with_low_latency(mut self, enabled: bool) -> Self {
        self.low_latency_mode = Some(enabled);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Converts the custom headers into a [`HeaderMap`].
    pub fn header_map(&self) -> Result<HeaderMap, EngineError> {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                EngineError::fatal(codes::LOAD_ERROR, format!("invalid header name `{name}`"))
                    .with_cause(e)
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                EngineError::fatal(codes::LOAD_ERROR, format!("invalid value for header `{name}`"))
                    .with_cause(e)
            })?;
            map.insert(header, value);
        }
        Ok(map)
    }
}
