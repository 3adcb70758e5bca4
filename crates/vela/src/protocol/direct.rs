use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use url::Url;

use super::{AdapterContext, AdapterEvent, LoadedMedia};
use crate::error::AdapterError;
use crate::quality::QualityLevel;
use crate::sink::{SinkEvent, SinkSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Loading,
    Ready,
    Failed,
}

struct State {
    phase: Phase,
    url: Option<Url>,
    level: Option<QualityLevel>,
}

/// Adapter for progressive files the sink can play by itself.
///
/// The sink fetches and decodes the URL; this adapter only waits for its
/// metadata and exposes a single quality level.
pub struct DirectAdapter {
    ctx: AdapterContext,
    state: Mutex<State>,
    destroyed: AtomicBool,
}

impl DirectAdapter {
    pub(crate) fn new(ctx: AdapterContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(State {
                phase: Phase::Idle,
                url: None,
                level: None,
            }),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Direct playback is the fallback for every URL.
    pub fn can_handle(_url: &str) -> bool {
        true
    }

    pub(crate) async fn load(
        &self,
        url: &Url,
        start_position: Option<f64>,
    ) -> Result<LoadedMedia, AdapterError> {
        let result = self.attach_and_wait(url, start_position).await;
        let mut state = self.state.lock();
        match result {
            Ok(level) => {
                state.phase = Phase::Ready;
                state.url = Some(url.clone());
                state.level = Some(level.clone());
                Ok(LoadedMedia {
                    levels: vec![level],
                    start_level: 0,
                    live: false,
                })
            }
            Err(err) => {
                state.phase = Phase::Failed;
                Err(err)
            }
        }
    }

    async fn attach_and_wait(
        &self,
        url: &Url,
        start_position: Option<f64>,
    ) -> Result<QualityLevel, AdapterError> {
        let ctx = &self.ctx;
        let (mut events, source) = {
            let mut state = self.state.lock();
            if self.destroyed.load(Ordering::SeqCst) {
                return Err(AdapterError::Cancelled);
            }
            let events = ctx.sink.subscribe();
            let source = ctx.sink.attach(SinkSource::Url {
                url: url.clone(),
                headers: ctx.headers.clone(),
            })?;
            state.phase = Phase::Loading;
            (events, source)
        };

        let metadata = async {
            loop {
                let notice = match events.recv().await {
                    Ok(notice) if notice.source == source => notice,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return Err(AdapterError::Cancelled),
                };
                match notice.event {
                    SinkEvent::LoadedMetadata { width, height, .. } => {
                        return Ok(QualityLevel::new(0, width, height));
                    }
                    SinkEvent::Error { code, message } => {
                        return Err(AdapterError::unsupported(format!(
                            "media error {code}: {message}"
                        )));
                    }
                    _ => continue,
                }
            }
        };

        let timeout = ctx.config.loader.metadata_timeout;
        let level = tokio::select! {
            _ = ctx.token.cancelled() => return Err(AdapterError::Cancelled),
            result = tokio::time::timeout(timeout, metadata) => {
                result.map_err(|_| AdapterError::MetadataTimeout(timeout))??
            }
        };
        debug!(%url, width = level.width, height = level.height, "Direct source ready");

        if let Some(position) = start_position.filter(|p| *p > 0.0) {
            ctx.sink.set_current_time(position);
        }
        Ok(level)
    }

    pub(crate) fn start_loading(&self, _level: usize) {
        if self.state.lock().phase == Phase::Ready {
            self.ctx.report(AdapterEvent::LevelSwitched(0));
        }
    }

    pub(crate) fn set_quality(&self, index: usize) {
        if index != 0 {
            debug!(index, "Direct sources have a single level");
        }
    }

    /// The single level can only be retried by re-attaching.
    pub(crate) fn retry_level(&self, _index: usize) {
        self.recover_error();
    }

    pub(crate) fn set_auto_quality(&self, _enabled: bool) {}

    pub(crate) fn current_level(&self) -> Option<usize> {
        (self.state.lock().phase == Phase::Ready).then_some(0)
    }

    pub(crate) fn levels(&self) -> Vec<QualityLevel> {
        self.state.lock().level.iter().cloned().collect()
    }

    /// Re-attach the source and return to the previous position.
    pub(crate) fn recover_error(&self) {
        let url = {
            let state = self.state.lock();
            if state.phase != Phase::Ready {
                return;
            }
            state.url.clone()
        };
        let Some(url) = url else {
            return;
        };

        let position = self.ctx.sink.current_time();
        debug!(%url, position, "Re-attaching direct source");
        if let Err(e) = self.ctx.sink.attach(SinkSource::Url {
            url,
            headers: self.ctx.headers.clone(),
        }) {
            warn!(error = %e, "Failed to re-attach direct source");
            return;
        }
        if position > 0.0 {
            self.ctx.sink.set_current_time(position);
        }
    }

    pub(crate) fn destroy(&self) {
        let attached = {
            let mut state = self.state.lock();
            if self.destroyed.swap(true, Ordering::SeqCst) {
                return;
            }
            let attached = matches!(state.phase, Phase::Loading | Phase::Ready);
            state.phase = Phase::Idle;
            attached
        };
        self.ctx.token.cancel();
        if attached {
            self.ctx.sink.detach();
        }
    }

    pub(crate) fn latency(&self) -> f64 {
        0.0
    }

    /// Source errors before the metadata arrived belong to the load itself.
    pub(crate) fn on_sink_event(&self, event: &SinkEvent) -> bool {
        matches!(event, SinkEvent::Error { .. }) && self.state.lock().phase != Phase::Ready
    }
}
