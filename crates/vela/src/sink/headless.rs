use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use super::{
    ChunkKind, MediaChunk, MediaSink, PlaybackQuality, SinkEvent, SinkNotice, SinkSource,
    SurfaceSize, TimeRange,
};
use crate::error::SinkError;

// Gaps smaller than this between appended chunks are merged.
const MERGE_TOLERANCE: f64 = 0.01;
const NOMINAL_FRAME_RATE: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    None,
    Url,
    Segments,
}

#[derive(Debug)]
struct State {
    source: Source,
    source_id: u64,
    duration: Option<f64>,
    current_time: f64,
    paused: bool,
    playing: bool,
    waiting: bool,
    ended: bool,
    end_of_stream: bool,
    metadata_sent: bool,
    can_play_sent: bool,
    ranges: Vec<TimeRange>,
    init_level: Option<usize>,
    appended_bytes: u64,
    volume: f64,
    muted: bool,
    rate: f64,
    quality: PlaybackQuality,
}

impl State {
    fn new() -> Self {
        Self {
            source: Source::None,
            source_id: 0,
            duration: None,
            current_time: 0.0,
            paused: true,
            playing: false,
            waiting: false,
            ended: false,
            end_of_stream: false,
            metadata_sent: false,
            can_play_sent: false,
            ranges: Vec::new(),
            init_level: None,
            appended_bytes: 0,
            volume: 1.0,
            muted: false,
            rate: 1.0,
            quality: PlaybackQuality::default(),
        }
    }

    /// Forget the source while keeping output settings, and start a new
    /// source id.
    fn reset(&mut self) {
        *self = Self {
            source_id: self.source_id + 1,
            volume: self.volume,
            muted: self.muted,
            rate: self.rate,
            ..Self::new()
        };
    }

    fn ahead(&self) -> f64 {
        self.ranges
            .iter()
            .find(|r| self.current_time >= r.start - MERGE_TOLERANCE && self.current_time < r.end)
            .map_or(0.0, |r| r.end - self.current_time)
    }

    fn insert_range(&mut self, start: f64, end: f64) {
        self.ranges.push(TimeRange::new(start, end));
        self.ranges
            .sort_by(|a, b| a.start.total_cmp(&b.start));
        let mut merged: Vec<TimeRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if range.start <= last.end + MERGE_TOLERANCE => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    fn at_end(&self) -> bool {
        if let Some(duration) = self.duration.filter(|d| d.is_finite()) {
            if self.current_time >= duration - MERGE_TOLERANCE {
                return true;
            }
        }
        self.end_of_stream
            && self
                .ranges
                .last()
                .is_none_or(|last| self.current_time >= last.end - MERGE_TOLERANCE)
    }

    /// Resume progress if possible, or report waiting.
    fn resume(&mut self, events: &mut Vec<SinkEvent>) {
        if self.paused || self.ended {
            return;
        }
        if self.ahead() > 0.0 {
            if !self.playing {
                self.playing = true;
                self.waiting = false;
                events.push(SinkEvent::Playing);
            }
        } else if !self.waiting {
            self.waiting = true;
            self.playing = false;
            events.push(SinkEvent::Waiting);
        }
    }
}

/// A [`MediaSink`] without any output.
///
/// It records buffered ranges from appended chunks and advances a virtual
/// clock when [`HeadlessSink::advance`] is called, emitting the same
/// lifecycle events a browser video element would. URL sources are treated
/// as fully available after attach.
pub struct HeadlessSink {
    state: Mutex<State>,
    events: broadcast::Sender<SinkNotice>,
    autoplay: bool,
    surface: Mutex<Option<SurfaceSize>>,
    video_size: (u32, u32),
    source_duration: f64,
    source_error: Option<(u16, String)>,
}

impl Default for HeadlessSink {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessSink {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::new()),
            events,
            autoplay: false,
            surface: Mutex::new(None),
            video_size: (1280, 720),
            source_duration: 60.0,
            source_error: None,
        }
    }

    /// Start playing as soon as media is available.
    pub fn with_autoplay(mut self, autoplay: bool) -> Self {
        self.autoplay = autoplay;
        self
    }

    pub fn with_surface(self, surface: SurfaceSize) -> Self {
        *self.surface.lock() = Some(surface);
        self
    }

    /// Dimensions reported in metadata.
    pub fn with_video_size(mut self, width: u32, height: u32) -> Self {
        self.video_size = (width, height);
        self
    }

    /// Duration reported for URL sources.
    pub fn with_source_duration(mut self, seconds: f64) -> Self {
        self.source_duration = seconds;
        self
    }

    /// Make every URL source fail with a media error.
    pub fn with_source_error(mut self, code: u16, message: impl Into<String>) -> Self {
        self.source_error = Some((code, message.into()));
        self
    }

    pub fn set_surface_size(&self, surface: Option<SurfaceSize>) {
        *self.surface.lock() = surface;
    }

    /// Emit an arbitrary event for the current source, e.g. to simulate a
    /// decoder failure.
    pub fn emit(&self, event: SinkEvent) {
        let source = self.state.lock().source_id;
        self.send_all(source, vec![event]);
    }

    /// Total bytes of media appended since the last attach.
    pub fn appended_bytes(&self) -> u64 {
        self.state.lock().appended_bytes
    }

    /// Level of the last init segment appended.
    pub fn init_level(&self) -> Option<usize> {
        self.state.lock().init_level
    }

    pub fn volume(&self) -> (f64, bool) {
        let state = self.state.lock();
        (state.volume, state.muted)
    }

    pub fn playback_rate(&self) -> f64 {
        self.state.lock().rate
    }

    /// Advance the virtual clock by `elapsed` of wall time.
    pub fn advance(&self, elapsed: Duration) {
        let mut events = Vec::new();
        let source = {
            let mut state = self.state.lock();
            if state.source == Source::None || state.paused || state.ended {
                return;
            }

            let wanted = elapsed.as_secs_f64() * state.rate;
            let moved = wanted.min(state.ahead());
            if moved > 0.0 {
                state.current_time += moved;
                state.quality.total_frames += (moved * NOMINAL_FRAME_RATE) as u64;
                events.push(SinkEvent::TimeUpdate);
            }

            if moved < wanted || state.ahead() <= 0.0 {
                if state.at_end() {
                    state.ended = true;
                    state.playing = false;
                    state.waiting = false;
                    state.paused = true;
                    events.push(SinkEvent::Ended);
                } else if !state.waiting {
                    state.waiting = true;
                    state.playing = false;
                    events.push(SinkEvent::Waiting);
                }
            }
            state.source_id
        };
        self.send_all(source, events);
    }

    fn send_all(&self, source: u64, events: Vec<SinkEvent>) {
        for event in events {
            trace!(source, ?event, "Headless sink event");
            let _ = self.events.send(SinkNotice { source, event });
        }
    }
}

#[async_trait]
impl MediaSink for HeadlessSink {
    fn attach(&self, source: SinkSource) -> Result<u64, SinkError> {
        let mut events = vec![SinkEvent::LoadStart];
        let id = {
            let mut state = self.state.lock();
            state.reset();
            state.paused = !self.autoplay;

            match source {
                SinkSource::Url { .. } => {
                    state.source = Source::Url;
                    if let Some((code, message)) = &self.source_error {
                        events.push(SinkEvent::Error {
                            code: *code,
                            message: message.clone(),
                        });
                    } else {
                        let duration = self.source_duration;
                        state.duration = Some(duration);
                        state.end_of_stream = true;
                        state.insert_range(0.0, duration);
                        state.metadata_sent = true;
                        state.can_play_sent = true;
                        events.push(SinkEvent::LoadedMetadata {
                            width: self.video_size.0,
                            height: self.video_size.1,
                            duration: Some(duration),
                        });
                        events.push(SinkEvent::CanPlay);
                        events.push(SinkEvent::Progress);
                        state.resume(&mut events);
                    }
                }
                SinkSource::Segments { live, duration } => {
                    state.source = Source::Segments;
                    state.duration = if live { Some(f64::INFINITY) } else { duration };
                }
            }
            state.source_id
        };
        self.send_all(id, events);
        Ok(id)
    }

    fn detach(&self) {
        self.state.lock().reset();
    }

    fn source_id(&self) -> u64 {
        self.state.lock().source_id
    }

    fn append(&self, chunk: MediaChunk) -> Result<(), SinkError> {
        let mut events = Vec::new();
        let source = {
            let mut state = self.state.lock();
            if state.source != Source::Segments {
                return Err(SinkError::NoSource);
            }
            state.appended_bytes += chunk.data.len() as u64;
            if chunk.kind == ChunkKind::Init {
                state.init_level = Some(chunk.level);
                return Ok(());
            }

            state.insert_range(chunk.start, chunk.start + chunk.duration);
            if !state.metadata_sent {
                state.metadata_sent = true;
                events.push(SinkEvent::LoadedMetadata {
                    width: self.video_size.0,
                    height: self.video_size.1,
                    duration: state.duration,
                });
            }
            events.push(SinkEvent::Progress);
            if !state.can_play_sent && state.ahead() > 0.0 {
                state.can_play_sent = true;
                events.push(SinkEvent::CanPlay);
            }
            state.resume(&mut events);
            state.source_id
        };
        self.send_all(source, events);
        Ok(())
    }

    fn end_of_stream(&self) {
        let mut state = self.state.lock();
        state.end_of_stream = true;
        if state.duration.is_none() {
            state.duration = state.ranges.last().map(|r| r.end);
        }
    }

    async fn play(&self) -> Result<(), SinkError> {
        let mut events = Vec::new();
        let source = {
            let mut state = self.state.lock();
            if state.source == Source::None {
                return Err(SinkError::NoSource);
            }
            if state.ended {
                state.ended = false;
                state.current_time = state.ranges.first().map_or(0.0, |r| r.start);
            }
            state.paused = false;
            state.resume(&mut events);
            state.source_id
        };
        self.send_all(source, events);
        Ok(())
    }

    fn pause(&self) {
        let mut state = self.state.lock();
        if state.paused {
            return;
        }
        state.paused = true;
        state.playing = false;
        state.waiting = false;
        let source = state.source_id;
        drop(state);
        self.send_all(source, vec![SinkEvent::Pause]);
    }

    fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn current_time(&self) -> f64 {
        self.state.lock().current_time
    }

    fn set_current_time(&self, seconds: f64) {
        let mut events = vec![SinkEvent::Seeking];
        let source = {
            let mut state = self.state.lock();
            let target = match state.duration.filter(|d| d.is_finite()) {
                Some(duration) => seconds.clamp(0.0, duration),
                None => seconds.max(0.0),
            };
            state.current_time = target;
            state.ended = false;
            state.playing = false;
            state.waiting = false;
            events.push(SinkEvent::Seeked);
            events.push(SinkEvent::TimeUpdate);
            state.resume(&mut events);
            state.source_id
        };
        self.send_all(source, events);
    }

    fn duration(&self) -> Option<f64> {
        self.state.lock().duration
    }

    fn buffered(&self) -> Vec<TimeRange> {
        self.state.lock().ranges.clone()
    }

    fn set_volume(&self, volume: f64) {
        self.state.lock().volume = volume;
    }

    fn set_muted(&self, muted: bool) {
        self.state.lock().muted = muted;
    }

    fn set_playback_rate(&self, rate: f64) {
        self.state.lock().rate = rate;
    }

    fn playback_quality(&self) -> PlaybackQuality {
        self.state.lock().quality
    }

    fn surface_size(&self) -> Option<SurfaceSize> {
        *self.surface.lock()
    }

    fn subscribe(&self) -> broadcast::Receiver<SinkNotice> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn media(start: f64, duration: f64) -> MediaChunk {
        MediaChunk {
            level: 0,
            kind: ChunkKind::Media,
            start,
            duration,
            data: Bytes::from_static(b"segment"),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SinkNotice>) -> Vec<SinkEvent> {
        let mut out = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            out.push(notice.event);
        }
        out
    }

    fn segments() -> SinkSource {
        SinkSource::Segments {
            live: false,
            duration: Some(6.0),
        }
    }

    #[test]
    fn merges_adjacent_ranges() {
        let sink = HeadlessSink::new();
        sink.attach(segments()).unwrap();
        sink.append(media(0.0, 2.0)).unwrap();
        sink.append(media(4.0, 2.0)).unwrap();
        assert_eq!(sink.buffered().len(), 2);
        sink.append(media(2.0, 2.0)).unwrap();
        assert_eq!(sink.buffered(), vec![TimeRange::new(0.0, 6.0)]);
    }

    #[test]
    fn append_without_source_fails() {
        let sink = HeadlessSink::new();
        assert!(matches!(sink.append(media(0.0, 1.0)), Err(SinkError::NoSource)));
    }

    #[tokio::test]
    async fn play_waits_until_media_arrives() {
        let sink = HeadlessSink::new();
        let mut rx = sink.subscribe();
        sink.attach(segments()).unwrap();
        sink.play().await.unwrap();
        assert_eq!(drain(&mut rx), vec![SinkEvent::LoadStart, SinkEvent::Waiting]);

        sink.append(media(0.0, 2.0)).unwrap();
        let events = drain(&mut rx);
        assert!(events.contains(&SinkEvent::CanPlay));
        assert_eq!(events.last(), Some(&SinkEvent::Playing));
    }

    #[test]
    fn autoplay_starts_on_first_chunk() {
        let sink = HeadlessSink::new().with_autoplay(true);
        let mut rx = sink.subscribe();
        sink.attach(segments()).unwrap();
        sink.append(media(0.0, 2.0)).unwrap();
        let events = drain(&mut rx);
        let can_play = events.iter().position(|e| *e == SinkEvent::CanPlay).unwrap();
        let playing = events.iter().position(|e| *e == SinkEvent::Playing).unwrap();
        assert!(can_play < playing);
    }

    #[test]
    fn advance_runs_dry_then_ends() {
        let sink = HeadlessSink::new().with_autoplay(true);
        sink.attach(segments()).unwrap();
        sink.append(media(0.0, 2.0)).unwrap();
        let mut rx = sink.subscribe();

        sink.advance(Duration::from_secs(3));
        assert_eq!(sink.current_time(), 2.0);
        assert_eq!(drain(&mut rx), vec![SinkEvent::TimeUpdate, SinkEvent::Waiting]);

        sink.append(media(2.0, 4.0)).unwrap();
        sink.end_of_stream();
        drain(&mut rx);
        sink.advance(Duration::from_secs(10));
        assert_eq!(sink.current_time(), 6.0);
        assert_eq!(drain(&mut rx), vec![SinkEvent::TimeUpdate, SinkEvent::Ended]);
    }

    #[test]
    fn seek_emits_seeking_then_seeked() {
        let sink = HeadlessSink::new();
        sink.attach(segments()).unwrap();
        sink.append(media(0.0, 6.0)).unwrap();
        let mut rx = sink.subscribe();
        sink.set_current_time(42.0);
        assert_eq!(sink.current_time(), 6.0);
        let events = drain(&mut rx);
        assert_eq!(&events[..2], &[SinkEvent::Seeking, SinkEvent::Seeked]);
    }

    #[test]
    fn events_carry_the_source_they_were_raised_under() {
        let sink = HeadlessSink::new().with_autoplay(true);
        let mut rx = sink.subscribe();
        let first = sink.attach(segments()).unwrap();
        assert_eq!(sink.source_id(), first);
        sink.append(media(0.0, 2.0)).unwrap();

        sink.detach();
        assert_ne!(sink.source_id(), first);
        let second = sink.attach(segments()).unwrap();
        assert!(second > first);
        sink.emit(SinkEvent::Progress);

        let mut seen = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            seen.push((notice.source, notice.event));
        }
        let playing = seen.iter().find(|(_, e)| *e == SinkEvent::Playing).unwrap();
        assert_eq!(playing.0, first);
        assert_eq!(seen.last(), Some(&(second, SinkEvent::Progress)));
    }

    #[test]
    fn url_source_reports_metadata_or_error() {
        let sink = HeadlessSink::new().with_video_size(640, 360);
        let mut rx = sink.subscribe();
        sink.attach(SinkSource::Url {
            url: url::Url::parse("http://localhost/movie.mp4").unwrap(),
            headers: Default::default(),
        })
        .unwrap();
        let events = drain(&mut rx);
        assert!(events.contains(&SinkEvent::LoadedMetadata {
            width: 640,
            height: 360,
            duration: Some(60.0),
        }));

        let failing = HeadlessSink::new().with_source_error(4, "unsupported");
        let mut rx = failing.subscribe();
        failing
            .attach(SinkSource::Url {
                url: url::Url::parse("http://localhost/movie.avi").unwrap(),
                headers: Default::default(),
            })
            .unwrap();
        assert!(matches!(drain(&mut rx)[1], SinkEvent::Error { code: 4, .. }));
    }
}
