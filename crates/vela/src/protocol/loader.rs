// Segment Loader: the fetch loop shared by the segmented and dynamic adapters.
//
// A source turns a quality level into a timeline of segments. The loader keeps
// the sink's buffer filled from the play position up to `max_buffer_length`,
// follows level switches at the next segment boundary and refreshes live
// timelines. Fatal failures are reported once, after which the loader parks
// until it is woken by a restart, a level switch or a seek.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

use super::{AdapterContext, AdapterEvent, LoadedMedia};
use crate::error::{AdapterError, EngineError, Namespace, Stage};
use crate::http::ByteRange;
use crate::quality::QualityLevel;
use crate::sink::{ChunkKind, MediaChunk, SinkEvent, SinkSource, TimeRange};

/// How often a full buffer is re-checked.
const IDLE_POLL: Duration = Duration::from_millis(250);
/// Tolerance when matching the play position against buffered ranges.
const POSITION_TOLERANCE: f64 = 0.1;
/// A segment ending this close to the fetch point counts as already loaded.
const SEGMENT_EPSILON: f64 = 0.05;
/// Gap between the play position and the live window that triggers a jump.
const LIVE_GAP_TOLERANCE: f64 = 0.5;

/// Initialization data shared by consecutive segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InitSegment {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
}

/// A media segment placed on the presentation timeline.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TimedSegment {
    pub url: Url,
    pub start: f64,
    pub duration: f64,
    pub byte_range: Option<ByteRange>,
    pub init: Option<InitSegment>,
}

impl TimedSegment {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Segments of one level, in presentation order.
#[derive(Debug, Clone)]
pub(crate) struct Timeline {
    pub segments: Vec<TimedSegment>,
    pub live: bool,
    /// Upper bound on segment duration in seconds
    pub target_duration: f64,
    /// How long a live timeline stays fresh
    pub refresh_interval: Duration,
}

impl Timeline {
    pub fn start(&self) -> f64 {
        self.segments.first().map_or(0.0, |s| s.start)
    }

    /// End of the last segment; the live edge for live timelines.
    pub fn end(&self) -> f64 {
        self.segments.last().map_or(0.0, TimedSegment::end)
    }

    pub fn total_duration(&self) -> f64 {
        self.end() - self.start()
    }

    /// First segment that still has media after `point`.
    pub fn next_after(&self, point: f64) -> Option<&TimedSegment> {
        self.segments
            .iter()
            .find(|segment| segment.end() > point + SEGMENT_EPSILON)
    }
}

/// Resolves quality levels into segment timelines.
#[async_trait]
pub(crate) trait TrackSource: Send + Sync + 'static {
    fn namespace(&self) -> Namespace;

    /// Stage reported when a timeline cannot be fetched.
    fn timeline_stage(&self) -> Stage;

    async fn timeline(&self, level: usize) -> Result<Timeline, AdapterError>;

    /// Forget anything cached so the next timeline is fetched fresh.
    fn invalidate(&self) {}
}

/// Where the next fetch should start and how much is buffered ahead.
fn fetch_point(ranges: &[TimeRange], position: f64) -> (f64, f64) {
    ranges
        .iter()
        .find(|r| position >= r.start - POSITION_TOLERANCE && position <= r.end + POSITION_TOLERANCE)
        .map_or((position, 0.0), |r| (r.end, (r.end - position).max(0.0)))
}

#[derive(Debug)]
struct Control {
    level: usize,
    playing: Option<usize>,
    live_edge: Option<f64>,
    seed: Option<(usize, Timeline)>,
}

struct LoaderShared {
    ctx: AdapterContext,
    source: Arc<dyn TrackSource>,
    control: Mutex<Control>,
    wake: Notify,
}

impl LoaderShared {
    /// Sleep for `duration` unless woken or cancelled first.
    async fn idle(&self, duration: Duration) {
        tokio::select! {
            _ = self.ctx.token.cancelled() => {}
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Report a fatal error and park until woken.
    async fn halt(&self, error: EngineError) {
        warn!(code = %error.code, "Segment loading halted: {}", error.message);
        self.ctx.report_error(error);
        tokio::select! {
            _ = self.ctx.token.cancelled() => {}
            _ = self.wake.notified() => {}
        }
    }

    async fn load_fragment(
        &self,
        level: usize,
        segment: &TimedSegment,
        last_init: &mut Option<(usize, InitSegment)>,
    ) -> Result<(u64, Duration), AdapterError> {
        let ctx = &self.ctx;
        let policy = &ctx.config.loader.fragment_retry;
        let namespace = self.source.namespace();

        if let Some(init) = &segment.init {
            let current = last_init
                .as_ref()
                .is_some_and(|(l, i)| *l == level && i == init);
            if !current {
                debug!(level, url = %init.url, "Loading init segment");
                let fetched = ctx
                    .fetch(&init.url, init.byte_range, policy, namespace, Stage::Frag)
                    .await?;
                ctx.sink.append(MediaChunk {
                    level,
                    kind: ChunkKind::Init,
                    start: segment.start,
                    duration: 0.0,
                    data: fetched.data,
                })?;
                *last_init = Some((level, init.clone()));
            }
        }

        let fetched = ctx
            .fetch(&segment.url, segment.byte_range, policy, namespace, Stage::Frag)
            .await?;
        let bytes = fetched.data.len() as u64;
        ctx.sink.append(MediaChunk {
            level,
            kind: ChunkKind::Media,
            start: segment.start,
            duration: segment.duration,
            data: fetched.data,
        })?;
        trace!(level, start = segment.start, bytes, "Appended fragment");
        Ok((bytes, fetched.elapsed))
    }

    async fn run(self: Arc<Self>) {
        let ctx = &self.ctx;
        let namespace = self.source.namespace();
        let mut timelines: HashMap<usize, (Timeline, Instant)> = HashMap::new();
        if let Some((level, timeline)) = self.control.lock().seed.take() {
            timelines.insert(level, (timeline, Instant::now()));
        }
        let mut last_init: Option<(usize, InitSegment)> = None;
        let mut end_of_stream = false;

        loop {
            if ctx.token.is_cancelled() {
                break;
            }
            let level = self.control.lock().level;

            let stale = timelines.get(&level).is_none_or(|(timeline, fetched_at)| {
                timeline.live && fetched_at.elapsed() >= timeline.refresh_interval
            });
            if stale {
                match self.source.timeline(level).await {
                    Ok(timeline) => {
                        self.control.lock().live_edge = timeline.live.then(|| timeline.end());
                        timelines.insert(level, (timeline, Instant::now()));
                    }
                    Err(AdapterError::Cancelled) => break,
                    Err(err) => {
                        let stage = self.source.timeline_stage();
                        self.halt(err.into_engine_error(namespace, stage, true)).await;
                        continue;
                    }
                }
            }
            let Some((timeline, _)) = timelines.get(&level) else {
                continue;
            };

            let position = ctx.sink.current_time();
            let (point, ahead) = fetch_point(&ctx.sink.buffered(), position);
            if ahead >= ctx.config.buffer.max_buffer_length {
                self.idle(IDLE_POLL).await;
                continue;
            }

            let Some(segment) = timeline.next_after(point).cloned() else {
                if timeline.live {
                    let wait = timeline.refresh_interval;
                    self.idle(wait).await;
                } else {
                    if !end_of_stream {
                        debug!(level, end = timeline.end(), "All segments loaded");
                        ctx.sink.end_of_stream();
                        end_of_stream = true;
                    }
                    self.idle(IDLE_POLL).await;
                }
                continue;
            };

            if timeline.live && ahead <= 0.0 && segment.start > point + LIVE_GAP_TOLERANCE {
                warn!(
                    position,
                    window_start = segment.start,
                    "Play position fell out of the live window, jumping ahead"
                );
                ctx.sink.set_current_time(segment.start);
            }

            match self.load_fragment(level, &segment, &mut last_init).await {
                Ok((bytes, elapsed)) => {
                    ctx.report(AdapterEvent::FragmentLoaded { bytes, elapsed });
                    let switched = {
                        let mut control = self.control.lock();
                        let switched = control.playing != Some(level);
                        control.playing = Some(level);
                        switched
                    };
                    if switched {
                        debug!(level, "Level switched");
                        ctx.report(AdapterEvent::LevelSwitched(level));
                    }
                }
                Err(AdapterError::Cancelled) => break,
                Err(err) => {
                    self.halt(err.into_engine_error(namespace, Stage::Frag, true))
                        .await;
                }
            }
        }
        trace!("Segment loader stopped");
    }
}

/// Owns the background fetch task for one loaded asset.
pub(crate) struct SegmentLoader {
    shared: Arc<LoaderShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SegmentLoader {
    pub fn new(
        ctx: AdapterContext,
        source: Arc<dyn TrackSource>,
        level: usize,
        seed: Option<Timeline>,
    ) -> Self {
        Self {
            shared: Arc::new(LoaderShared {
                ctx,
                source,
                control: Mutex::new(Control {
                    level,
                    playing: None,
                    live_edge: seed.as_ref().filter(|t| t.live).map(Timeline::end),
                    seed: seed.map(|timeline| (level, timeline)),
                }),
                wake: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the fetch task unless it is already running.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            self.shared.wake.notify_one();
            return;
        }
        *task = Some(tokio::spawn(Arc::clone(&self.shared).run()));
    }

    /// Stop and start again with fresh timelines.
    pub fn restart(&self) {
        self.stop();
        self.shared.source.invalidate();
        self.start();
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Set the level without waking the task. A wake stored before the task
    /// runs would cut short its first halt.
    pub fn select_level(&self, level: usize) {
        self.shared.control.lock().level = level;
    }

    /// Continue with `level` from the next segment boundary.
    pub fn switch_level(&self, level: usize) {
        self.shared.control.lock().level = level;
        self.shared.wake.notify_one();
    }

    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    pub fn level(&self) -> usize {
        self.shared.control.lock().level
    }

    /// Level of the most recently appended fragment.
    pub fn playing_level(&self) -> Option<usize> {
        self.shared.control.lock().playing
    }

    pub fn live_edge(&self) -> Option<f64> {
        self.shared.control.lock().live_edge
    }
}

impl Drop for SegmentLoader {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Session {
    levels: Vec<QualityLevel>,
    live: bool,
    start_position: Option<f64>,
    loader: SegmentLoader,
}

/// Adapter state common to every segment-based protocol.
pub(crate) struct SegmentedCore {
    ctx: AdapterContext,
    session: Mutex<Option<Session>>,
    destroyed: AtomicBool,
}

impl SegmentedCore {
    pub fn new(ctx: AdapterContext) -> Self {
        Self {
            ctx,
            session: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn ctx(&self) -> &AdapterContext {
        &self.ctx
    }

    /// Attach the sink and prepare the loader once levels are known.
    ///
    /// Live sources without an explicit start begin `live_sync_duration_count`
    /// target durations behind the edge, or `target_latency` behind it in
    /// low-latency mode.
    pub fn install(
        &self,
        source: Arc<dyn TrackSource>,
        levels: Vec<QualityLevel>,
        start_level: usize,
        timeline: Timeline,
        start_position: Option<f64>,
    ) -> Result<LoadedMedia, AdapterError> {
        let mut session = self.session.lock();
        if self.destroyed.load(Ordering::SeqCst) || self.ctx.token.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        let live = timeline.live;
        let duration = (!live).then(|| timeline.end());
        let start_position = if live {
            let behind = if self.ctx.low_latency {
                self.ctx.config.buffer.target_latency
            } else {
                timeline.target_duration * f64::from(self.ctx.config.loader.live_sync_duration_count)
            };
            let start = start_position.unwrap_or(timeline.end() - behind);
            Some(start.clamp(timeline.start(), timeline.end()))
        } else {
            start_position
        };
        self.ctx.sink.attach(SinkSource::Segments { live, duration })?;

        debug!(
            levels = levels.len(),
            start_level,
            live,
            ?start_position,
            "Segmented source ready"
        );
        let loader = SegmentLoader::new(self.ctx.clone(), source, start_level, Some(timeline));
        *session = Some(Session {
            levels: levels.clone(),
            live,
            start_position,
            loader,
        });
        Ok(LoadedMedia {
            levels,
            start_level,
            live,
        })
    }

    pub fn start_loading(&self, level: usize) {
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            return;
        };
        let level = level.min(session.levels.len().saturating_sub(1));
        session.loader.select_level(level);
        if let Some(position) = session.start_position.take() {
            self.ctx.sink.set_current_time(position);
        }
        session.loader.start();
    }

    pub fn set_quality(&self, index: usize) {
        if let Some(session) = self.session.lock().as_ref() {
            if index < session.levels.len() && session.loader.level() != index {
                debug!(index, "Switching level");
                session.loader.switch_level(index);
            }
        }
    }

    /// Resume fetching on `index` after a failure. Wakes the loader even
    /// when it is already on that level.
    pub fn retry_level(&self, index: usize) {
        if let Some(session) = self.session.lock().as_ref() {
            let index = index.min(session.levels.len().saturating_sub(1));
            debug!(index, "Retrying on level");
            session.loader.switch_level(index);
        }
    }

    pub fn set_auto_quality(&self, enabled: bool) {
        trace!(enabled, "Automatic level selection toggled");
    }

    pub fn current_level(&self) -> Option<usize> {
        self.session
            .lock()
            .as_ref()
            .and_then(|session| session.loader.playing_level())
    }

    pub fn levels(&self) -> Vec<QualityLevel> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.levels.clone())
            .unwrap_or_default()
    }

    pub fn recover_error(&self) {
        if let Some(session) = self.session.lock().as_ref() {
            debug!("Restarting segment loader");
            session.loader.restart();
        }
    }

    pub fn destroy(&self) {
        let session = {
            let mut guard = self.session.lock();
            if self.destroyed.swap(true, Ordering::SeqCst) {
                return;
            }
            guard.take()
        };
        self.ctx.token.cancel();
        if let Some(session) = session {
            session.loader.stop();
            self.ctx.sink.detach();
        }
    }

    pub fn latency(&self) -> f64 {
        let guard = self.session.lock();
        match guard.as_ref() {
            Some(session) if session.live => session
                .loader
                .live_edge()
                .map_or(0.0, |edge| (edge - self.ctx.sink.current_time()).max(0.0)),
            _ => 0.0,
        }
    }

    pub fn on_sink_event(&self, event: &SinkEvent) -> bool {
        if matches!(event, SinkEvent::Seeked) {
            if let Some(session) = self.session.lock().as_ref() {
                session.loader.wake();
            }
        }
        false
    }
}
