//! Engine orchestrator.
//!
//! [`Engine`] owns the playback state machine and wires the sink, the
//! selected protocol adapter, the buffer monitor, the quality controller and
//! the recovery planner together. All mutable state lives behind one lock.
//! Events collected while it is held are queued before it is released and
//! delivered afterwards by one publisher at a time, so listeners see them in
//! commit order and may call back into the engine.
//!
//! Every load bumps a generation counter. Completions, adapter reports and
//! timers carry the generation they were started under and are dropped when
//! it no longer matches.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::buffer::{BufferInfo, BufferMonitor};
use crate::config::{EngineConfig, StreamConfig};
use crate::error::{AdapterError, EngineError, SinkError, codes};
use crate::events::{EngineEvent, EventBus, EventKind, Subscription};
use crate::http::create_client;
use crate::protocol::{AdapterContext, AdapterEvent, Protocol, ProtocolAdapter};
use crate::quality::{AbrInputs, QualityController, QualityLevel};
use crate::recovery::{RecoveryAction, RecoveryKind, RecoveryPlanner};
use crate::sink::{MediaSink, SinkEvent, SinkNotice};
use crate::state::{EngineStats, PlaybackState};

const MIN_PLAYBACK_RATE: f64 = 0.25;
const MAX_PLAYBACK_RATE: f64 = 4.0;

type Outbox = Vec<EngineEvent>;
type RecoveryTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Per-load resources. Dropped as a whole when the asset is replaced.
struct Session {
    stream: StreamConfig,
    adapter: Arc<ProtocolAdapter>,
    token: CancellationToken,
    /// The adapter resolved its load
    loaded: bool,
    tick: Option<JoinHandle<()>>,
    adapter_pump: Option<JoinHandle<()>>,
    pending_recovery: Option<JoinHandle<()>>,
    /// A recovery action ran and playback has not resumed yet
    recovering: bool,
    stall_since: Option<Instant>,
    stall_reported: bool,
    reported_level: Option<usize>,
}

impl Session {
    fn shutdown(mut self) {
        self.token.cancel();
        for task in [
            self.tick.take(),
            self.adapter_pump.take(),
            self.pending_recovery.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.adapter.destroy();
    }
}

struct Inner {
    state: PlaybackState,
    generation: u64,
    session: Option<Session>,
    buffer: BufferMonitor,
    quality: QualityController,
    recovery: RecoveryPlanner,
    destroyed: bool,
}

impl Inner {
    fn transition(&mut self, out: &mut Outbox, to: PlaybackState) {
        if self.state == to {
            return;
        }
        debug!(from = %self.state, %to, "State transition");
        self.state = to;
        out.push(EngineEvent::StateChange(to));
    }

    /// Release the current session and everything derived from it.
    fn teardown(&mut self, keep_recovery_history: bool) {
        if let Some(session) = self.session.take() {
            session.shutdown();
        }
        self.buffer.clear();
        self.quality.reset();
        if !keep_recovery_history {
            self.recovery.reset();
        }
    }

    fn current(&self, generation: u64) -> Option<&Session> {
        if self.generation == generation {
            self.session.as_ref()
        } else {
            None
        }
    }

    fn current_mut(&mut self, generation: u64) -> Option<&mut Session> {
        if self.generation == generation {
            self.session.as_mut()
        } else {
            None
        }
    }
}

struct Shared {
    sink: Arc<dyn MediaSink>,
    config: Arc<EngineConfig>,
    http: Client,
    bus: EventBus<EngineEvent>,
    inner: Mutex<Inner>,
    /// Committed events awaiting delivery. Only filled under `inner`.
    pending: Mutex<VecDeque<EngineEvent>>,
    /// Held by the thread currently delivering `pending`
    publishing: Mutex<()>,
    sink_pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(pump) = self.sink_pump.get_mut().take() {
            pump.abort();
        }
        if let Some(session) = self.inner.get_mut().session.take() {
            session.shutdown();
        }
    }
}

/// Adaptive streaming playback engine.
///
/// Cloning yields another handle to the same engine. Background tasks only
/// hold weak references, so the engine shuts down once the last handle is
/// dropped.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Create an engine that drives `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(sink: Arc<dyn MediaSink>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            EngineError::non_fatal(codes::CONFIG_ERROR, "engine requires a Tokio runtime")
                .with_cause(e)
        })?;
        let http = create_client(&config.http).map_err(|e| {
            EngineError::non_fatal(codes::CONFIG_ERROR, "failed to build HTTP client")
                .with_cause(e)
        })?;

        let inner = Inner {
            state: PlaybackState::Idle,
            generation: 0,
            session: None,
            buffer: BufferMonitor::new(Arc::clone(&sink), config.buffer.clone()),
            quality: QualityController::new(config.abr.clone()),
            recovery: RecoveryPlanner::new(config.recovery.clone()),
            destroyed: false,
        };
        let sink_events = sink.subscribe();
        let shared = Arc::new(Shared {
            sink,
            config: Arc::new(config),
            http,
            bus: EventBus::new(),
            inner: Mutex::new(inner),
            pending: Mutex::new(VecDeque::new()),
            publishing: Mutex::new(()),
            sink_pump: Mutex::new(None),
        });

        let pump = runtime.spawn(sink_pump(Arc::downgrade(&shared), sink_events));
        *shared.sink_pump.lock() = Some(pump);
        Ok(Self { shared })
    }

    fn from_weak(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    fn weak(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    /// Run `f` under the state lock and publish the events it queued.
    fn update<R>(&self, f: impl FnOnce(&mut Inner, &mut Outbox) -> R) -> R {
        let result = {
            let mut inner = self.shared.inner.lock();
            let mut out = Outbox::new();
            let result = f(&mut inner, &mut out);
            self.shared.pending.lock().extend(out);
            result
        };
        self.publish();
        result
    }

    /// Queue an event that does not depend on engine state.
    fn emit(&self, event: EngineEvent) {
        self.shared.pending.lock().push_back(event);
        self.publish();
    }

    /// Deliver queued events unless another thread, or a listener further
    /// up this stack, is already doing so.
    fn publish(&self) {
        loop {
            {
                let Some(_publishing) = self.shared.publishing.try_lock() else {
                    return;
                };
                loop {
                    let Some(event) = self.shared.pending.lock().pop_front() else {
                        break;
                    };
                    self.shared.bus.emit(&event);
                }
            }
            // An event queued while the guard was held may have skipped delivery.
            if self.shared.pending.lock().is_empty() {
                return;
            }
        }
    }

    pub fn events(&self) -> &EventBus<EngineEvent> {
        &self.shared.bus
    }

    /// Subscribe to one kind of engine event.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription<EngineEvent>
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.shared.bus.on(kind, handler)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Which adapter would handle `url` with automatic detection.
    pub fn is_supported(url: &str) -> Protocol {
        Protocol::detect(url)
    }

    /// Load a new asset, replacing the current one.
    ///
    /// Resolves once quality levels are known and fetching has started. A
    /// load superseded by a later one resolves with `Ok(())` and has no
    /// further effect.
    pub async fn load(&self, stream: StreamConfig) -> Result<(), EngineError> {
        self.load_inner(stream, false).await
    }

    async fn load_inner(
        &self,
        stream: StreamConfig,
        keep_recovery_history: bool,
    ) -> Result<(), EngineError> {
        if self.shared.inner.lock().destroyed {
            return Err(EngineError::fatal(
                codes::ENGINE_DESTROYED,
                "engine has been destroyed",
            ));
        }

        let prepared = Url::parse(stream.url.trim())
            .map_err(|e| {
                EngineError::fatal(codes::LOAD_ERROR, format!("invalid URL `{}`", stream.url))
                    .with_cause(e)
            })
            .and_then(|url| stream.header_map().map(|headers| (url, headers)));
        let (url, headers) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(url = %stream.url, error = %err.message, "Rejected stream");
                self.update(|inner, out| {
                    inner.teardown(keep_recovery_history);
                    inner.generation += 1;
                    out.push(EngineEvent::Error(err.clone()));
                    inner.transition(out, PlaybackState::Error);
                    out.push(EngineEvent::RecoveryPlanned(RecoveryAction::fatal(
                        "stream configuration is invalid",
                    )));
                });
                return Err(err);
            }
        };

        let protocol = Protocol::resolve(stream.protocol, url.as_str());
        let low_latency = stream
            .low_latency_mode
            .unwrap_or(self.shared.config.buffer.low_latency_mode);
        let token = CancellationToken::new();
        let (events, adapter_events) = mpsc::unbounded_channel();
        let adapter = Arc::new(ProtocolAdapter::new(
            protocol,
            AdapterContext {
                sink: Arc::clone(&self.shared.sink),
                http: self.shared.http.clone(),
                config: Arc::clone(&self.shared.config),
                headers,
                low_latency,
                events,
                token: token.clone(),
            },
        ));

        let weak = self.weak();
        let generation = self.update(|inner, out| {
            inner.teardown(keep_recovery_history);
            inner.generation += 1;
            let generation = inner.generation;
            inner.buffer.set_low_latency(low_latency);
            inner.session = Some(Session {
                stream: stream.clone(),
                adapter: Arc::clone(&adapter),
                token,
                loaded: false,
                tick: None,
                adapter_pump: Some(tokio::spawn(adapter_pump(
                    weak,
                    generation,
                    adapter_events,
                ))),
                pending_recovery: None,
                recovering: keep_recovery_history,
                stall_since: None,
                stall_reported: false,
                reported_level: None,
            });
            inner.transition(out, PlaybackState::Loading);
            generation
        });
        info!(%url, %protocol, generation, "Loading stream");

        let result = adapter.load(&url, stream.start_position).await;

        match result {
            Ok(media) => {
                let start_level = media.start_level;
                let fresh = self.update(|inner, out| {
                    if inner.current(generation).is_none() {
                        return false;
                    }
                    inner.quality.set_levels(media.levels.clone());
                    inner.quality.set_current_level(start_level);
                    out.push(EngineEvent::QualityLevelsLoaded(media.levels));
                    if let Some(session) = inner.current_mut(generation) {
                        session.loaded = true;
                        session.tick = Some(tokio::spawn(tick_loop(
                            self.weak(),
                            generation,
                            self.shared.config.tick_interval,
                        )));
                    }
                    true
                });
                if !fresh {
                    debug!(generation, "Discarding superseded load");
                    return Ok(());
                }
                info!(
                    generation,
                    levels = self.shared.inner.lock().quality.levels().len(),
                    start_level,
                    live = media.live,
                    "Stream loaded"
                );
                adapter.start_loading(start_level);
                Ok(())
            }
            Err(err) => {
                if !self.is_current(generation) || matches!(err, AdapterError::Cancelled) {
                    debug!(generation, error = %err, "Superseded load failed");
                    return Ok(());
                }
                let error = EngineError::fatal(
                    codes::LOAD_ERROR,
                    format!("failed to load {url}: {err}"),
                )
                .with_cause(err);
                self.handle_error(generation, error.clone());
                Err(error)
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared.inner.lock().current(generation).is_some()
    }

    /// Start or resume playback.
    pub async fn play(&self) -> Result<(), EngineError> {
        match self.shared.sink.play().await {
            Ok(()) => {
                self.update(|inner, out| {
                    if inner.state == PlaybackState::Paused {
                        inner.transition(out, PlaybackState::Playing);
                    }
                });
                Ok(())
            }
            Err(SinkError::Aborted) => {
                debug!("Play request interrupted by a new load");
                Ok(())
            }
            Err(e) => {
                let error = EngineError::non_fatal(codes::PLAY_ERROR, e.to_string()).with_cause(e);
                warn!(error = %error, "Play request rejected");
                self.emit(EngineEvent::Error(error.clone()));
                Err(error)
            }
        }
    }

    pub fn pause(&self) {
        self.shared.sink.pause();
        self.update(|inner, out| {
            if matches!(
                inner.state,
                PlaybackState::Playing | PlaybackState::Buffering
            ) {
                inner.transition(out, PlaybackState::Paused);
            }
        });
    }

    /// Seek to `seconds`, clamped to the known duration.
    pub fn seek(&self, seconds: f64) {
        if !seconds.is_finite() || seconds < 0.0 {
            debug!(seconds, "Ignoring invalid seek target");
            return;
        }
        let target = match self.shared.sink.duration() {
            Some(duration) if duration.is_finite() => seconds.min(duration),
            _ => seconds,
        };
        self.shared.sink.set_current_time(target);
    }

    pub fn set_volume(&self, volume: f64) {
        if volume.is_nan() {
            return;
        }
        self.shared.sink.set_volume(volume.clamp(0.0, 1.0));
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.sink.set_muted(muted);
    }

    pub fn set_playback_rate(&self, rate: f64) {
        if rate.is_nan() {
            return;
        }
        self.shared
            .sink
            .set_playback_rate(rate.clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE));
    }

    /// Pin quality level `index` and leave automatic mode.
    ///
    /// Returns false when no such level exists.
    pub fn set_quality(&self, index: usize) -> bool {
        let adapter = self.update(|inner, _| {
            inner.quality.select_level(index)?;
            inner.session.as_ref().map(|s| Arc::clone(&s.adapter))
        });
        match adapter {
            Some(adapter) => {
                info!(index, "Quality pinned");
                adapter.set_auto_quality(false);
                adapter.set_quality(index);
                true
            }
            None => {
                warn!(index, "No such quality level");
                false
            }
        }
    }

    pub fn set_auto_quality(&self, enabled: bool) {
        let adapter = self.update(|inner, _| {
            inner.quality.set_auto_mode(enabled);
            inner.session.as_ref().map(|s| Arc::clone(&s.adapter))
        });
        if let Some(adapter) = adapter {
            adapter.set_auto_quality(enabled);
        }
    }

    pub fn quality_levels(&self) -> Vec<QualityLevel> {
        self.shared.inner.lock().quality.levels().to_vec()
    }

    pub fn current_quality(&self) -> Option<QualityLevel> {
        self.shared.inner.lock().quality.current_level().cloned()
    }

    pub fn is_auto_quality(&self) -> bool {
        self.shared.inner.lock().quality.is_auto()
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.inner.lock().state
    }

    pub fn buffer_info(&self) -> BufferInfo {
        self.shared.inner.lock().buffer.buffer_info()
    }

    pub fn stats(&self) -> EngineStats {
        let inner = self.shared.inner.lock();
        self.shared.collect_stats(&inner)
    }

    /// Tear down the current asset and return to idle.
    pub fn unload(&self) {
        self.update(|inner, out| {
            inner.teardown(false);
            inner.generation += 1;
            inner.transition(out, PlaybackState::Idle);
        });
        debug!("Stream unloaded");
    }

    /// Unload, detach all listeners and refuse further loads.
    pub fn destroy(&self) {
        self.unload();
        self.shared.inner.lock().destroyed = true;
        self.shared.bus.remove_all_listeners(None);
        if let Some(pump) = self.shared.sink_pump.lock().take() {
            pump.abort();
        }
        info!("Engine destroyed");
    }

    /// A recovery action is scheduled and has not run yet.
    pub fn is_recovery_pending(&self) -> bool {
        self.shared
            .inner
            .lock()
            .session
            .as_ref()
            .is_some_and(|s| s.pending_recovery.is_some())
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.inner.lock().destroyed
    }

    fn on_sink_event(&self, notice: SinkNotice) {
        let SinkNotice { source, event } = notice;
        if source != self.shared.sink.source_id() {
            trace!(source, ?event, "Dropping event from a replaced source");
            return;
        }
        let adapter = {
            let inner = self.shared.inner.lock();
            match inner.session.as_ref() {
                Some(session) => (Arc::clone(&session.adapter), inner.generation),
                None => return,
            }
        };
        let (adapter, generation) = adapter;
        if adapter.on_sink_event(&event) {
            return;
        }

        if let SinkEvent::Error { code, message } = event {
            warn!(code, %message, "Sink reported an error");
            self.handle_error(generation, EngineError::fatal(codes::media_error(code), message));
            return;
        }
        self.update(|inner, out| self.shared.apply_sink_event(inner, out, generation, event));
    }

    fn on_adapter_event(&self, generation: u64, event: AdapterEvent) {
        match event {
            AdapterEvent::Error(error) => self.handle_error(generation, error),
            AdapterEvent::FragmentLoaded { bytes, elapsed } => self.update(|inner, _| {
                if inner.current(generation).is_some() {
                    inner.buffer.record_fragment_load(bytes, elapsed);
                }
            }),
            AdapterEvent::LevelSwitched(index) => self.update(|inner, out| {
                let Some(level) = inner.quality.level(index).cloned() else {
                    return;
                };
                let Some(session) = inner.current_mut(generation) else {
                    return;
                };
                if session.reported_level != Some(index) {
                    session.reported_level = Some(index);
                    info!(index, name = %level.name, bitrate = level.bitrate, "Quality switched");
                    out.push(EngineEvent::QualityChange(level));
                }
            }),
        }
    }

    /// Publish `error` and, when fatal, plan and schedule a recovery.
    fn handle_error(&self, generation: u64, error: EngineError) {
        let now = Instant::now();
        let weak = self.weak();
        self.update(|inner, out| {
            if inner.generation != generation {
                return;
            }
            out.push(EngineEvent::Error(error.clone()));
            if !error.fatal {
                debug!(code = %error.code, message = %error.message, "Non-fatal error");
                return;
            }
            inner.transition(out, PlaybackState::Error);

            let Some(session) = inner.session.as_mut() else {
                out.push(EngineEvent::RecoveryPlanned(RecoveryAction::fatal(
                    "no stream loaded",
                )));
                return;
            };
            let action = inner.recovery.analyze(&error, now);
            out.push(EngineEvent::RecoveryPlanned(action.clone()));
            if action.kind == RecoveryKind::Fatal {
                error!(code = %error.code, reason = %action.reason, "Giving up on recovery");
                return;
            }
            warn!(
                code = %error.code,
                action = %action.kind,
                delay_ms = action.delay.as_millis() as u64,
                reason = %action.reason,
                "Scheduling recovery"
            );
            session.recovering = true;
            if let Some(previous) = session.pending_recovery.take() {
                previous.abort();
            }
            session.pending_recovery = Some(tokio::spawn(recovery_task(weak, generation, action)));
        });
    }

    async fn execute_recovery(&self, generation: u64, action: RecoveryAction) {
        let Some((adapter, loaded, stream)) = self.update(|inner, _| {
            let session = inner.current_mut(generation)?;
            session.pending_recovery.take();
            Some((
                Arc::clone(&session.adapter),
                session.loaded,
                session.stream.clone(),
            ))
        }) else {
            return;
        };
        info!(action = %action.kind, reason = %action.reason, "Executing recovery");

        match action.kind {
            RecoveryKind::Retry if loaded => {
                adapter.recover_error();
                self.resume_after_recovery(generation);
            }
            RecoveryKind::Retry | RecoveryKind::Reload => {
                if let Err(e) = self.load_inner(stream, true).await {
                    debug!(error = %e, "Reload failed");
                }
            }
            RecoveryKind::SeekPast => {
                let sink = &self.shared.sink;
                let mut target = sink.current_time() + self.shared.config.seek_past_offset;
                if let Some(duration) = sink.duration().filter(|d| d.is_finite()) {
                    target = target.min(duration);
                }
                self.resume_after_recovery(generation);
                sink.set_current_time(target);
            }
            RecoveryKind::DowngradeQuality => {
                let index = self.update(|inner, _| inner.quality.step_down(Instant::now()));
                self.resume_after_recovery(generation);
                match index {
                    Some(index) => adapter.retry_level(index),
                    None => adapter.recover_error(),
                }
            }
            RecoveryKind::Fatal => {}
        }
    }

    fn resume_after_recovery(&self, generation: u64) {
        self.update(|inner, out| {
            if inner.current(generation).is_some() && inner.state == PlaybackState::Error {
                inner.transition(out, PlaybackState::Buffering);
            }
        });
    }

    /// Periodic stats, stall detection and quality evaluation.
    fn tick(&self, generation: u64) {
        let now = Instant::now();
        let config = &self.shared.config;
        let sink = &self.shared.sink;
        let (switch, stalled) = self.update(|inner, out| {
            let state = inner.state;
            let loaded = inner.current(generation).is_some_and(|s| s.loaded);
            if !loaded || matches!(state, PlaybackState::Idle | PlaybackState::Loading) {
                return (None, None);
            }
            out.push(EngineEvent::Stats(self.shared.collect_stats(inner)));

            let starving = state == PlaybackState::Buffering && !inner.buffer.is_buffer_healthy();
            let mut stalled = None;
            if let Some(session) = inner.current_mut(generation) {
                match (starving, config.stall_timeout) {
                    (true, Some(timeout)) => {
                        let since = *session.stall_since.get_or_insert(now);
                        if !session.stall_reported && now.duration_since(since) >= timeout {
                            session.stall_reported = true;
                            stalled = Some(EngineError::fatal(
                                codes::BUFFER_STALLED_ERROR,
                                format!("buffer stalled for {:.1}s", timeout.as_secs_f64()),
                            ));
                        }
                    }
                    _ => {
                        session.stall_since = None;
                        session.stall_reported = false;
                    }
                }
            }

            let mut switch = None;
            if inner.quality.is_auto()
                && !matches!(state, PlaybackState::Error | PlaybackState::Ended)
            {
                let inputs = AbrInputs {
                    estimated_bitrate: inner.buffer.optimal_bitrate(),
                    buffer_health: inner.buffer.buffer_health(),
                    surface: sink.surface_size(),
                };
                let decision = inner.quality.optimal_level(now, &inputs);
                if decision.changed {
                    debug!(index = ?decision.index, reason = %decision.reason, "ABR decision");
                    switch = decision
                        .index
                        .zip(inner.session.as_ref().map(|s| Arc::clone(&s.adapter)));
                }
            }
            (switch, stalled)
        });

        if let Some((index, adapter)) = switch {
            adapter.set_quality(index);
        }
        if let Some(error) = stalled {
            self.handle_error(generation, error);
        }
    }
}

impl Shared {
    fn collect_stats(&self, inner: &Inner) -> EngineStats {
        let quality = inner.quality.current_level().cloned();
        EngineStats {
            current_time: self.sink.current_time(),
            duration: self.sink.duration().unwrap_or(0.0),
            buffer: inner.buffer.buffer_info(),
            bitrate: quality.as_ref().map_or(0, |level| level.bitrate),
            dropped_frames: self.sink.playback_quality().dropped_frames,
            latency: inner.session.as_ref().map_or(0.0, |s| s.adapter.latency()),
            download_speed: inner.buffer.average_download_speed(),
            quality,
            state: inner.state,
        }
    }

    /// Map a sink lifecycle event onto the state machine.
    fn apply_sink_event(
        &self,
        inner: &mut Inner,
        out: &mut Outbox,
        generation: u64,
        event: SinkEvent,
    ) {
        use PlaybackState as S;

        if inner.current(generation).is_none() {
            return;
        }
        let state = inner.state;
        let resting = if self.sink.is_paused() {
            S::Paused
        } else {
            S::Playing
        };

        match event {
            SinkEvent::LoadStart | SinkEvent::LoadedMetadata { .. } | SinkEvent::Error { .. } => {}
            SinkEvent::CanPlay => {
                if state == S::Loading {
                    let next = if resting == S::Paused {
                        S::Paused
                    } else {
                        S::Buffering
                    };
                    inner.transition(out, next);
                }
            }
            SinkEvent::Playing => {
                if state == S::Ended {
                    return;
                }
                inner.transition(out, S::Playing);
                if let Some(session) = inner.session.as_mut()
                    && session.recovering
                {
                    session.recovering = false;
                    info!("Playback recovered");
                    out.push(EngineEvent::Recovered);
                }
            }
            SinkEvent::Pause => {
                if matches!(state, S::Playing | S::Buffering) {
                    inner.transition(out, S::Paused);
                }
            }
            SinkEvent::Waiting => {
                if matches!(state, S::Playing | S::Paused) {
                    inner.transition(out, S::Buffering);
                }
            }
            SinkEvent::Seeking => {
                if !matches!(state, S::Idle | S::Loading) {
                    inner.transition(out, S::Seeking);
                }
            }
            SinkEvent::Seeked => {
                if state == S::Seeking {
                    inner.transition(out, resting);
                }
            }
            SinkEvent::Ended => {
                if state != S::Ended {
                    inner.transition(out, S::Ended);
                    out.push(EngineEvent::Ended);
                }
            }
            SinkEvent::TimeUpdate => out.push(EngineEvent::TimeUpdate {
                current_time: self.sink.current_time(),
                duration: self.sink.duration().unwrap_or(0.0),
            }),
            SinkEvent::Progress => out.push(EngineEvent::BufferUpdate(inner.buffer.buffer_info())),
        }
    }
}

async fn sink_pump(weak: Weak<Shared>, mut events: broadcast::Receiver<SinkNotice>) {
    loop {
        match events.recv().await {
            Ok(notice) => {
                let Some(engine) = Engine::from_weak(&weak) else {
                    break;
                };
                engine.on_sink_event(notice);
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Sink events lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn adapter_pump(
    weak: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<AdapterEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(engine) = Engine::from_weak(&weak) else {
            break;
        };
        engine.on_adapter_event(generation, event);
    }
}

async fn tick_loop(weak: Weak<Shared>, generation: u64, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(engine) = Engine::from_weak(&weak) else {
            break;
        };
        engine.tick(generation);
    }
}

fn recovery_task(weak: Weak<Shared>, generation: u64, action: RecoveryAction) -> RecoveryTask {
    Box::pin(async move {
        tokio::time::sleep(action.delay).await;
        if let Some(engine) = Engine::from_weak(&weak) {
            engine.execute_recovery(generation, action).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::sink::HeadlessSink;

    fn engine(sink: Arc<HeadlessSink>) -> Engine {
        Engine::new(sink, EngineConfig::default()).unwrap()
    }

    fn record(engine: &Engine, kind: EventKind) -> Arc<Mutex<Vec<EngineEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _ = engine.on(kind, move |event| sink.lock().push(event.clone()));
        seen
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn starts_idle() {
        let engine = engine(Arc::new(HeadlessSink::new()));
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert!(engine.quality_levels().is_empty());
        assert_eq!(engine.stats().state, PlaybackState::Idle);
        assert_eq!(Engine::is_supported("http://x/a.m3u8"), Protocol::Segmented);
        assert_eq!(Engine::is_supported("http://x/a.mpd"), Protocol::Dynamic);
        assert_eq!(Engine::is_supported("http://x/a.mp4"), Protocol::Direct);
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let config = EngineConfig::default().with_tick_interval(Duration::ZERO);
        let err = Engine::new(Arc::new(HeadlessSink::new()), config)
            .err()
            .unwrap();
        assert_eq!(err.code, codes::CONFIG_ERROR);
    }

    #[tokio::test]
    async fn invalid_url_fails_without_recovery() {
        let engine = engine(Arc::new(HeadlessSink::new()));
        let errors = record(&engine, EventKind::Error);
        let err = engine.load(StreamConfig::new("not a url")).await.unwrap_err();
        assert_eq!(err.code, codes::LOAD_ERROR);
        assert!(err.fatal);
        assert_eq!(engine.state(), PlaybackState::Error);
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(engine.shared.inner.lock().recovery.attempts(), 0);
    }

    #[tokio::test]
    async fn direct_load_reaches_playing() {
        let sink = Arc::new(HeadlessSink::new().with_autoplay(true));
        let engine = engine(Arc::clone(&sink));
        let states = record(&engine, EventKind::StateChange);
        let levels = record(&engine, EventKind::QualityLevelsLoaded);

        engine
            .load(StreamConfig::new("http://cdn.example/movie.mp4"))
            .await
            .unwrap();
        settle().await;

        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(levels.lock().len(), 1);
        assert_eq!(engine.quality_levels().len(), 1);
        let states: Vec<_> = states
            .lock()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::StateChange(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(states.first(), Some(&PlaybackState::Loading));
        assert_eq!(states.last(), Some(&PlaybackState::Playing));
    }

    #[tokio::test]
    async fn sink_events_drive_state() {
        let sink = Arc::new(HeadlessSink::new());
        let engine = engine(Arc::clone(&sink));
        engine
            .load(StreamConfig::new("http://cdn.example/movie.mp4"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(engine.state(), PlaybackState::Paused);

        engine.play().await.unwrap();
        settle().await;
        assert_eq!(engine.state(), PlaybackState::Playing);

        engine.pause();
        assert_eq!(engine.state(), PlaybackState::Paused);

        engine.seek(5.0);
        settle().await;
        assert_eq!(engine.state(), PlaybackState::Paused);
        assert_eq!(sink.current_time(), 5.0);
    }

    #[tokio::test]
    async fn seek_ignores_invalid_targets() {
        let sink = Arc::new(HeadlessSink::new());
        let engine = engine(Arc::clone(&sink));
        engine.seek(f64::NAN);
        engine.seek(-3.0);
        assert_eq!(sink.current_time(), 0.0);
    }

    #[tokio::test]
    async fn unload_returns_to_idle() {
        let sink = Arc::new(HeadlessSink::new());
        let engine = engine(Arc::clone(&sink));
        engine
            .load(StreamConfig::new("http://cdn.example/movie.mp4"))
            .await
            .unwrap();
        engine.unload();
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert!(engine.quality_levels().is_empty());
        assert!(engine.current_quality().is_none());
        assert!(sink.duration().is_none());
    }

    #[tokio::test]
    async fn destroy_detaches_listeners_and_refuses_loads() {
        let engine = engine(Arc::new(HeadlessSink::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _sub = engine.on(EventKind::StateChange, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        engine.destroy();
        engine.destroy();
        assert_eq!(engine.events().listener_count(EventKind::StateChange), 0);

        let err = engine
            .load(StreamConfig::new("http://cdn.example/movie.mp4"))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::ENGINE_DESTROYED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(engine.is_destroyed());
    }

    #[tokio::test]
    async fn quality_selection_pins_manual_mode() {
        let engine = engine(Arc::new(HeadlessSink::new()));
        engine
            .load(StreamConfig::new("http://cdn.example/movie.mp4"))
            .await
            .unwrap();
        assert!(engine.is_auto_quality());
        assert!(!engine.set_quality(3));
        assert!(engine.is_auto_quality());
        assert!(engine.set_quality(0));
        assert!(!engine.is_auto_quality());
        engine.set_auto_quality(true);
        assert!(engine.is_auto_quality());
    }

    #[tokio::test]
    async fn media_errors_are_fatal() {
        let sink = Arc::new(HeadlessSink::new());
        let engine = engine(Arc::clone(&sink));
        let errors = record(&engine, EventKind::Error);
        engine
            .load(StreamConfig::new("http://cdn.example/movie.mp4"))
            .await
            .unwrap();
        settle().await;

        sink.emit(SinkEvent::Error {
            code: 3,
            message: "decode failure".into(),
        });
        settle().await;

        assert_eq!(engine.state(), PlaybackState::Error);
        let errors = errors.lock();
        let EngineEvent::Error(error) = &errors[0] else {
            panic!("expected an error event");
        };
        assert_eq!(error.code, "MEDIA_ERROR_3");
        assert!(error.fatal);
        assert_eq!(engine.shared.inner.lock().recovery.attempts(), 1);
        assert!(engine.is_recovery_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn seeks_past_decode_errors_and_recovers() {
        let sink = Arc::new(HeadlessSink::new().with_autoplay(true));
        let engine = engine(Arc::clone(&sink));
        let recovered = record(&engine, EventKind::Recovered);
        engine
            .load(StreamConfig::new("http://cdn.example/movie.mp4"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(engine.state(), PlaybackState::Playing);

        sink.emit(SinkEvent::Error {
            code: 3,
            message: "decode failure".into(),
        });
        settle().await;
        assert_eq!(engine.state(), PlaybackState::Error);

        tokio::time::sleep(Duration::from_millis(250)).await;
        settle().await;
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(recovered.lock().len(), 1);
        assert_eq!(sink.current_time(), 1.0);
    }

    #[tokio::test]
    async fn listeners_may_call_back_into_the_engine() {
        let engine = engine(Arc::new(HeadlessSink::new()));
        let handle = engine.clone();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&observed);
        let _sub = engine.on(EventKind::StateChange, move |_| {
            seen.lock().push(handle.state());
        });
        engine
            .load(StreamConfig::new("http://cdn.example/movie.mp4"))
            .await
            .unwrap();
        assert_eq!(observed.lock().first(), Some(&PlaybackState::Loading));
    }

    #[tokio::test]
    async fn every_fatal_error_is_followed_by_its_plan() {
        let sink = Arc::new(HeadlessSink::new());
        let engine = engine(Arc::clone(&sink));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Error, EventKind::RecoveryPlanned] {
            let seen = Arc::clone(&seen);
            let _ = engine.on(kind, move |event| seen.lock().push(event.clone()));
        }

        assert!(engine.load(StreamConfig::new("not a url")).await.is_err());
        engine
            .load(StreamConfig::new("http://cdn.example/movie.mp4"))
            .await
            .unwrap();
        settle().await;
        sink.emit(SinkEvent::Error {
            code: 3,
            message: "decode failure".into(),
        });
        settle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert!(matches!(&seen[0], EngineEvent::Error(e) if e.code == codes::LOAD_ERROR));
        assert!(matches!(&seen[1], EngineEvent::RecoveryPlanned(a) if a.kind == RecoveryKind::Fatal));
        assert!(matches!(&seen[2], EngineEvent::Error(e) if e.code == "MEDIA_ERROR_3"));
        assert!(
            matches!(&seen[3], EngineEvent::RecoveryPlanned(a) if a.kind == RecoveryKind::SeekPast)
        );
    }

    #[tokio::test]
    async fn reentrant_changes_are_delivered_after_the_current_one() {
        let sink = Arc::new(HeadlessSink::new().with_autoplay(true));
        let engine = engine(Arc::clone(&sink));
        let handle = engine.clone();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&observed);
        let _sub = engine.on(EventKind::StateChange, move |event| {
            let EngineEvent::StateChange(state) = event else {
                return;
            };
            seen.lock().push(*state);
            if *state == PlaybackState::Playing {
                handle.pause();
            }
        });

        engine
            .load(StreamConfig::new("http://cdn.example/movie.mp4"))
            .await
            .unwrap();
        settle().await;

        let observed = observed.lock();
        assert_eq!(engine.state(), PlaybackState::Paused);
        assert_eq!(
            observed[observed.len() - 2..],
            [PlaybackState::Playing, PlaybackState::Paused]
        );
    }
}
