//! Protocol adapters.
//!
//! Exactly one adapter is alive per loaded asset. Adapters own their fetches
//! and background tasks and report back to the engine through an
//! [`AdapterEvent`] channel; they never touch engine state directly.

mod dash;
mod direct;
mod hls;
mod loader;

pub use dash::DashAdapter;
pub use direct::DirectAdapter;
pub use hls::HlsAdapter;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::Serialize;
use strum::Display;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{EngineConfig, ProtocolHint};
use crate::error::{AdapterError, EngineError, Namespace, Stage};
use crate::http::{self, ByteRange, Fetched};
use crate::quality::QualityLevel;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::sink::{MediaSink, SinkEvent};

/// Transport family of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Segmented manifest streaming (HLS)
    Segmented,
    /// Dynamic manifest streaming (DASH)
    Dynamic,
    /// Progressive or direct file playback
    Direct,
}

impl Protocol {
    /// Sniff the protocol from a URL, in priority order.
    pub fn detect(url: &str) -> Self {
        if HlsAdapter::can_handle(url) {
            Self::Segmented
        } else if DashAdapter::can_handle(url) {
            Self::Dynamic
        } else {
            Self::Direct
        }
    }

    pub fn resolve(hint: ProtocolHint, url: &str) -> Self {
        match hint {
            ProtocolHint::Auto => Self::detect(url),
            ProtocolHint::Segmented => Self::Segmented,
            ProtocolHint::Dynamic => Self::Dynamic,
            ProtocolHint::Direct => Self::Direct,
        }
    }

    pub fn namespace(self) -> Namespace {
        match self {
            Self::Segmented => Namespace::Hls,
            Self::Dynamic => Namespace::Dash,
            Self::Direct => Namespace::Direct,
        }
    }
}

/// Notifications from an adapter to the engine.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// The first fragment of a new level has been appended.
    LevelSwitched(usize),
    FragmentLoaded { bytes: u64, elapsed: Duration },
    Error(EngineError),
}

/// Result of a successful [`ProtocolAdapter::load`].
#[derive(Debug, Clone)]
pub struct LoadedMedia {
    /// Bitrate-ascending levels
    pub levels: Vec<QualityLevel>,
    pub start_level: usize,
    pub live: bool,
}

/// Everything an adapter needs from the engine for one load.
#[derive(Clone)]
pub(crate) struct AdapterContext {
    pub sink: Arc<dyn MediaSink>,
    pub http: Client,
    pub config: Arc<EngineConfig>,
    pub headers: HeaderMap,
    pub low_latency: bool,
    pub events: mpsc::UnboundedSender<AdapterEvent>,
    /// Cancelled when the adapter is destroyed
    pub token: CancellationToken,
}

impl AdapterContext {
    pub fn report(&self, event: AdapterEvent) {
        if !self.token.is_cancelled() {
            let _ = self.events.send(event);
        }
    }

    pub fn report_error(&self, error: EngineError) {
        self.report(AdapterEvent::Error(error));
    }

    fn report_retry(&self, err: &AdapterError, namespace: Namespace, stage: Stage) {
        self.report_error(EngineError::non_fatal(
            err.code(namespace, stage),
            err.to_string(),
        ));
    }

    /// Fetch with the given retry policy. Each retried failure is reported as
    /// a non-fatal error.
    pub async fn fetch(
        &self,
        url: &Url,
        range: Option<ByteRange>,
        policy: &RetryPolicy,
        namespace: Namespace,
        stage: Stage,
    ) -> Result<Fetched, AdapterError> {
        let client = &self.http;
        let headers = &self.headers;
        retry_with_backoff(
            policy,
            &self.token,
            |err, _| self.report_retry(err, namespace, stage),
            move |_| async move { RetryAction::from(http::fetch(client, url, headers, range).await) },
        )
        .await
    }

    /// Fetch a manifest body as text.
    pub async fn fetch_text(
        &self,
        url: &Url,
        policy: &RetryPolicy,
        namespace: Namespace,
        stage: Stage,
    ) -> Result<String, AdapterError> {
        let client = &self.http;
        let headers = &self.headers;
        retry_with_backoff(
            policy,
            &self.token,
            |err, _| self.report_retry(err, namespace, stage),
            move |_| async move {
                RetryAction::from(
                    http::fetch_text(client, url, headers)
                        .await
                        .map(|(text, _)| text),
                )
            },
        )
        .await
    }
}

/// The adapter selected for the current asset.
pub enum ProtocolAdapter {
    Segmented(HlsAdapter),
    Dynamic(DashAdapter),
    Direct(DirectAdapter),
}

macro_rules! dispatch {
    ($self:ident, $adapter:ident => $body:expr) => {
        match $self {
            ProtocolAdapter::Segmented($adapter) => $body,
            ProtocolAdapter::Dynamic($adapter) => $body,
            ProtocolAdapter::Direct($adapter) => $body,
        }
    };
}

impl ProtocolAdapter {
    pub(crate) fn new(protocol: Protocol, ctx: AdapterContext) -> Self {
        match protocol {
            Protocol::Segmented => Self::Segmented(HlsAdapter::new(ctx)),
            Protocol::Dynamic => Self::Dynamic(DashAdapter::new(ctx)),
            Protocol::Direct => Self::Direct(DirectAdapter::new(ctx)),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Segmented(_) => Protocol::Segmented,
            Self::Dynamic(_) => Protocol::Dynamic,
            Self::Direct(_) => Protocol::Direct,
        }
    }

    /// Resolves once quality levels are known and the sink is attached.
    pub async fn load(
        &self,
        url: &Url,
        start_position: Option<f64>,
    ) -> Result<LoadedMedia, AdapterError> {
        dispatch!(self, adapter => adapter.load(url, start_position).await)
    }

    /// Begin fetching media at `level`.
    pub fn start_loading(&self, level: usize) {
        dispatch!(self, adapter => adapter.start_loading(level))
    }

    pub fn set_quality(&self, index: usize) {
        dispatch!(self, adapter => adapter.set_quality(index))
    }

    /// Fetch `index` again after a failure, even when it is already the
    /// loading level.
    pub fn retry_level(&self, index: usize) {
        dispatch!(self, adapter => adapter.retry_level(index))
    }

    pub fn set_auto_quality(&self, enabled: bool) {
        dispatch!(self, adapter => adapter.set_auto_quality(enabled))
    }

    pub fn current_level(&self) -> Option<usize> {
        dispatch!(self, adapter => adapter.current_level())
    }

    pub fn levels(&self) -> Vec<QualityLevel> {
        dispatch!(self, adapter => adapter.levels())
    }

    /// Re-attempt loading without discarding buffered media where possible.
    pub fn recover_error(&self) {
        dispatch!(self, adapter => adapter.recover_error())
    }

    /// Release everything the adapter holds. Safe to call repeatedly.
    pub fn destroy(&self) {
        dispatch!(self, adapter => adapter.destroy())
    }

    /// Distance from the live edge in seconds, 0 for on-demand content.
    pub fn latency(&self) -> f64 {
        dispatch!(self, adapter => adapter.latency())
    }

    /// Offer a sink event to the adapter. Returns true when the adapter
    /// consumed it and the engine should not handle it further.
    pub fn on_sink_event(&self, event: &SinkEvent) -> bool {
        dispatch!(self, adapter => adapter.on_sink_event(event))
    }
}

/// Level to start from: the configured one, clamped, or the lowest.
pub(crate) fn initial_level(config: &EngineConfig, level_count: usize) -> usize {
    config
        .abr
        .start_level
        .map_or(0, |level| level.min(level_count.saturating_sub(1)))
}

/// Resolve `reference` against `base`.
pub(crate) fn resolve_url(base: &Url, reference: &str) -> Result<Url, AdapterError> {
    base.join(reference.trim())
        .map_err(|e| AdapterError::invalid_url(reference, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_in_priority_order() {
        let cases = [
            ("http://cdn/live/stream.m3u8", Protocol::Segmented),
            ("http://cdn/live/stream.M3U8?token=1", Protocol::Segmented),
            ("http://cdn/list.m3u", Protocol::Segmented),
            ("http://cdn/hls/channel/42", Protocol::Segmented),
            ("http://cdn/index.m3u8/../manifest.mpd", Protocol::Segmented),
            ("http://cdn/vod/manifest.mpd", Protocol::Dynamic),
            ("http://cdn/vod/manifest.MPD?x=1", Protocol::Dynamic),
            ("http://cdn/movie/file.mp4", Protocol::Direct),
            ("http://cdn/live/123.ts", Protocol::Direct),
        ];
        for (url, expected) in cases {
            assert_eq!(Protocol::detect(url), expected, "{url}");
        }
    }

    #[test]
    fn hints_override_detection() {
        let url = "http://cdn/movie/file.mp4";
        assert_eq!(Protocol::resolve(ProtocolHint::Auto, url), Protocol::Direct);
        assert_eq!(Protocol::resolve(ProtocolHint::Segmented, url), Protocol::Segmented);
        assert_eq!(Protocol::resolve(ProtocolHint::Dynamic, url), Protocol::Dynamic);
    }

    #[test]
    fn namespaces_follow_protocol() {
        assert_eq!(Protocol::Segmented.namespace().to_string(), "HLS");
        assert_eq!(Protocol::Dynamic.namespace().to_string(), "DASH");
        assert_eq!(Protocol::Direct.namespace().to_string(), "DIRECT");
    }
}
