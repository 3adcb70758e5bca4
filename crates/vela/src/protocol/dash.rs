// DASH Adapter: MPD parsing and segment addressing on top of the segment loader.
//
// Levels come from the representations of the primary video adaptation set of
// the current period. Segments are addressed through `SegmentTemplate`
// (number or timeline based) or, for single-file representations, through the
// representation's `BaseURL`. Dynamic MPDs derive the available window from
// `availabilityStartTime` and `timeShiftBufferDepth`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::loader::{InitSegment, SegmentedCore, TimedSegment, Timeline, TrackSource};
use super::{AdapterContext, LoadedMedia, initial_level, resolve_url};
use crate::error::{AdapterError, Namespace, Stage};
use crate::quality::{QualityLevel, rank_levels};
use crate::sink::SinkEvent;

/// Time-shift window assumed when a dynamic MPD does not declare one.
const DEFAULT_TIME_SHIFT: f64 = 30.0;
/// Upper bound on the segments one representation may expand to.
const MAX_SEGMENTS: u64 = 200_000;
/// Live manifests are refreshed at least this often.
const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Deserialize)]
struct Mpd {
    #[serde(rename = "@type", default)]
    kind: Option<String>,
    #[serde(rename = "@mediaPresentationDuration", default)]
    media_presentation_duration: Option<String>,
    #[serde(rename = "@availabilityStartTime", default)]
    availability_start_time: Option<String>,
    #[serde(rename = "@timeShiftBufferDepth", default)]
    time_shift_buffer_depth: Option<String>,
    #[serde(rename = "@minimumUpdatePeriod", default)]
    minimum_update_period: Option<String>,
    #[serde(rename = "BaseURL", default)]
    base_urls: Vec<String>,
    #[serde(rename = "Period", default)]
    periods: Vec<Period>,
}

#[derive(Debug, Clone, Deserialize)]
struct Period {
    #[serde(rename = "@start", default)]
    start: Option<String>,
    #[serde(rename = "@duration", default)]
    duration: Option<String>,
    #[serde(rename = "BaseURL", default)]
    base_urls: Vec<String>,
    #[serde(rename = "AdaptationSet", default)]
    adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Clone, Deserialize)]
struct AdaptationSet {
    #[serde(rename = "@contentType", default)]
    content_type: Option<String>,
    #[serde(rename = "@mimeType", default)]
    mime_type: Option<String>,
    #[serde(rename = "@codecs", default)]
    codecs: Option<String>,
    #[serde(rename = "BaseURL", default)]
    base_urls: Vec<String>,
    #[serde(rename = "SegmentTemplate", default)]
    segment_template: Option<SegmentTemplate>,
    #[serde(rename = "Representation", default)]
    representations: Vec<Representation>,
}

#[derive(Debug, Clone, Deserialize)]
struct Representation {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@bandwidth", default)]
    bandwidth: u64,
    #[serde(rename = "@width", default)]
    width: Option<u32>,
    #[serde(rename = "@height", default)]
    height: Option<u32>,
    #[serde(rename = "@codecs", default)]
    codecs: Option<String>,
    #[serde(rename = "@mimeType", default)]
    mime_type: Option<String>,
    #[serde(rename = "BaseURL", default)]
    base_urls: Vec<String>,
    #[serde(rename = "SegmentTemplate", default)]
    segment_template: Option<SegmentTemplate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SegmentTemplate {
    #[serde(rename = "@media", default)]
    media: Option<String>,
    #[serde(rename = "@initialization", default)]
    initialization: Option<String>,
    #[serde(rename = "@timescale", default)]
    timescale: Option<u64>,
    #[serde(rename = "@duration", default)]
    duration: Option<u64>,
    #[serde(rename = "@startNumber", default)]
    start_number: Option<u64>,
    #[serde(rename = "@presentationTimeOffset", default)]
    presentation_time_offset: Option<u64>,
    #[serde(rename = "SegmentTimeline", default)]
    segment_timeline: Option<SegmentTimeline>,
}

#[derive(Debug, Clone, Deserialize)]
struct SegmentTimeline {
    #[serde(rename = "S", default)]
    entries: Vec<S>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct S {
    #[serde(rename = "@t", default)]
    t: Option<u64>,
    #[serde(rename = "@d")]
    d: u64,
    #[serde(rename = "@r", default)]
    r: Option<i64>,
}

impl Mpd {
    fn parse(text: &str) -> Result<Self, AdapterError> {
        quick_xml::de::from_str(text)
            .map_err(|e| AdapterError::manifest(format!("failed to parse MPD: {e}")))
    }

    fn is_dynamic(&self) -> bool {
        self.kind.as_deref() == Some("dynamic")
    }

    /// The first period for static presentations, the latest for dynamic ones.
    fn current_period(&self) -> Result<&Period, AdapterError> {
        let period = if self.is_dynamic() {
            self.periods.last()
        } else {
            self.periods.first()
        };
        period.ok_or_else(|| AdapterError::manifest("MPD has no periods"))
    }
}

impl Period {
    fn start(&self) -> f64 {
        self.start.as_deref().and_then(parse_duration).unwrap_or(0.0)
    }

    fn duration(&self, mpd: &Mpd) -> Option<f64> {
        self.duration.as_deref().and_then(parse_duration).or_else(|| {
            mpd.media_presentation_duration
                .as_deref()
                .and_then(parse_duration)
                .map(|total| (total - self.start()).max(0.0))
        })
    }

    /// The video adaptation set, or the first one when none is marked video.
    fn primary_set(&self) -> Option<&AdaptationSet> {
        self.adaptation_sets
            .iter()
            .find(|set| set.is_video())
            .or_else(|| self.adaptation_sets.first())
    }
}

impl AdaptationSet {
    fn is_video(&self) -> bool {
        let video_mime = |mime: &Option<String>| {
            mime.as_deref().is_some_and(|m| m.starts_with("video/"))
        };
        self.content_type.as_deref() == Some("video")
            || video_mime(&self.mime_type)
            || self
                .representations
                .iter()
                .any(|rep| video_mime(&rep.mime_type) || rep.width.is_some())
    }
}

impl SegmentTemplate {
    /// Fill unset attributes from the enclosing template.
    fn inherit(&self, parent: Option<&SegmentTemplate>) -> SegmentTemplate {
        let Some(parent) = parent else {
            return self.clone();
        };
        SegmentTemplate {
            media: self.media.clone().or_else(|| parent.media.clone()),
            initialization: self
                .initialization
                .clone()
                .or_else(|| parent.initialization.clone()),
            timescale: self.timescale.or(parent.timescale),
            duration: self.duration.or(parent.duration),
            start_number: self.start_number.or(parent.start_number),
            presentation_time_offset: self
                .presentation_time_offset
                .or(parent.presentation_time_offset),
            segment_timeline: self
                .segment_timeline
                .clone()
                .or_else(|| parent.segment_timeline.clone()),
        }
    }
}

/// Parse an ISO 8601 duration such as `PT1H2M3.5S` into seconds.
fn parse_duration(value: &str) -> Option<f64> {
    let rest = value.trim().strip_prefix('P')?;
    let (date, time) = rest.split_once('T').unwrap_or((rest, ""));

    let mut total = 0.0;
    let mut parse_part = |part: &str, units: &[(char, f64)]| -> Option<()> {
        let mut number = String::new();
        for ch in part.chars() {
            if ch.is_ascii_digit() || ch == '.' {
                number.push(ch);
                continue;
            }
            let (_, scale) = units.iter().find(|(unit, _)| *unit == ch)?;
            total += number.parse::<f64>().ok()? * scale;
            number.clear();
        }
        number.is_empty().then_some(())
    };
    parse_part(
        date,
        &[('Y', 31_536_000.0), ('M', 2_592_000.0), ('W', 604_800.0), ('D', 86_400.0)],
    )?;
    parse_part(time, &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)])?;
    Some(total)
}

/// Substitute `$Identifier$` placeholders in a segment template.
fn expand_template(template: &str, representation: &Representation, number: u64, time: u64) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(open) = rest.find('$') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('$') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let token = &after[..close];
        let (name, format) = token.split_once('%').unwrap_or((token, ""));
        let width = format
            .strip_prefix('0')
            .and_then(|f| f.strip_suffix('d'))
            .and_then(|w| w.parse::<usize>().ok())
            .unwrap_or(0);
        match name {
            "" => out.push('$'),
            "RepresentationID" => out.push_str(&representation.id),
            "Number" => out.push_str(&format!("{number:0width$}")),
            "Bandwidth" => out.push_str(&format!("{:0width$}", representation.bandwidth)),
            "Time" => out.push_str(&format!("{time:0width$}")),
            _ => {
                out.push('$');
                out.push_str(token);
                out.push('$');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn chain_base(base: &Url, candidates: &[String]) -> Result<Url, AdapterError> {
    match candidates.first() {
        Some(reference) => resolve_url(base, reference),
        None => Ok(base.clone()),
    }
}

/// Seconds since `availabilityStartTime`, if the MPD declares one.
fn elapsed_since_start(mpd: &Mpd, now: DateTime<Utc>) -> Result<Option<f64>, AdapterError> {
    let Some(start) = mpd.availability_start_time.as_deref() else {
        return Ok(None);
    };
    let start = DateTime::parse_from_rfc3339(start.trim())
        .map_err(|e| AdapterError::manifest(format!("bad availabilityStartTime `{start}`: {e}")))?;
    let elapsed = now.signed_duration_since(start.with_timezone(&Utc));
    Ok(Some(elapsed.num_milliseconds() as f64 / 1000.0))
}

/// Number/time pairs with their presentation start and duration in seconds.
struct Addressed {
    number: u64,
    time: u64,
    start: f64,
    duration: f64,
}

fn too_many_segments() -> AdapterError {
    AdapterError::manifest(format!("representation expands to more than {MAX_SEGMENTS} segments"))
}

fn timeline_entries(
    template: &SegmentTemplate,
    timeline: &SegmentTimeline,
    period_start: f64,
    period_end: Option<f64>,
) -> Result<Vec<Addressed>, AdapterError> {
    let timescale = template.timescale.unwrap_or(1).max(1);
    let offset = template.presentation_time_offset.unwrap_or(0);
    let to_seconds = |t: u64| period_start + (t as f64 - offset as f64) / timescale as f64;

    let mut out = Vec::new();
    let mut number = template.start_number.unwrap_or(1);
    let mut cursor = 0u64;
    for (idx, entry) in timeline.entries.iter().enumerate() {
        if entry.d == 0 {
            continue;
        }
        let mut time = entry.t.unwrap_or(cursor);
        let count = match entry.r {
            Some(r) if r >= 0 => (r as u64).saturating_add(1),
            Some(_) => {
                // Repeat until the next entry or the end of the period.
                let end = timeline
                    .entries
                    .get(idx + 1)
                    .and_then(|next| next.t)
                    .or_else(|| {
                        period_end.map(|end| {
                            (((end - period_start) * timescale as f64) as u64).saturating_add(offset)
                        })
                    })
                    .unwrap_or(time.saturating_add(entry.d));
                end.saturating_sub(time).div_ceil(entry.d).max(1)
            }
            None => 1,
        };
        if out.len() as u64 + count > MAX_SEGMENTS {
            return Err(too_many_segments());
        }
        for _ in 0..count {
            out.push(Addressed {
                number,
                time,
                start: to_seconds(time),
                duration: entry.d as f64 / timescale as f64,
            });
            time = time.saturating_add(entry.d);
            number = number.saturating_add(1);
        }
        cursor = time;
    }
    Ok(out)
}

fn numbered_entries(
    template: &SegmentTemplate,
    period_start: f64,
    period_duration: Option<f64>,
    live_elapsed: Option<f64>,
    time_shift: f64,
) -> Result<Vec<Addressed>, AdapterError> {
    let timescale = template.timescale.unwrap_or(1).max(1);
    let duration = template
        .duration
        .filter(|d| *d > 0)
        .ok_or_else(|| AdapterError::manifest("SegmentTemplate without duration or timeline"))?;
    let seconds = duration as f64 / timescale as f64;
    let start_number = template.start_number.unwrap_or(1);
    let offset = template.presentation_time_offset.unwrap_or(0);

    let (first, last) = match live_elapsed {
        Some(elapsed) => {
            let into_period = elapsed - period_start;
            // Only segments that are complete are available.
            let last = ((into_period / seconds).floor() as i64).saturating_sub(1);
            let first = ((into_period - time_shift) / seconds).floor().max(0.0) as i64;
            (first, last)
        }
        None => {
            let total = period_duration
                .ok_or_else(|| AdapterError::manifest("static MPD without a duration"))?;
            (0, ((total / seconds).ceil() as i64).saturating_sub(1))
        }
    };

    let first = first.max(0);
    if last >= first && (last - first) as u64 >= MAX_SEGMENTS {
        return Err(too_many_segments());
    }
    let mut out = Vec::new();
    for i in first..=last {
        let i = i as u64;
        let start = i as f64 * seconds;
        let length = match (live_elapsed, period_duration) {
            (None, Some(total)) => seconds.min(total - start),
            _ => seconds,
        };
        out.push(Addressed {
            number: start_number.saturating_add(i),
            time: offset.saturating_add(i.saturating_mul(duration)),
            start: period_start + start,
            duration: length,
        });
    }
    Ok(out)
}

/// Build the segment timeline of one representation.
fn build_timeline(
    mpd_url: &Url,
    mpd: &Mpd,
    representation_id: &str,
    now: DateTime<Utc>,
    min_refresh: Duration,
) -> Result<Timeline, AdapterError> {
    let live = mpd.is_dynamic();
    let period = mpd.current_period()?;
    let set = period
        .primary_set()
        .ok_or_else(|| AdapterError::manifest("period has no adaptation sets"))?;
    let representation = set
        .representations
        .iter()
        .find(|rep| rep.id == representation_id)
        .ok_or_else(|| {
            AdapterError::manifest(format!("representation `{representation_id}` not found"))
        })?;

    let base = chain_base(mpd_url, &mpd.base_urls)?;
    let base = chain_base(&base, &period.base_urls)?;
    let base = chain_base(&base, &set.base_urls)?;
    let base = chain_base(&base, &representation.base_urls)?;

    let period_start = period.start();
    let period_duration = period.duration(mpd);
    let live_elapsed = if live {
        Some(elapsed_since_start(mpd, now)?.ok_or_else(|| {
            AdapterError::manifest("dynamic MPD without availabilityStartTime")
        })?)
    } else {
        None
    };
    let time_shift = mpd
        .time_shift_buffer_depth
        .as_deref()
        .and_then(parse_duration)
        .unwrap_or(DEFAULT_TIME_SHIFT);

    let template = match (&representation.segment_template, &set.segment_template) {
        (Some(own), parent) => Some(own.inherit(parent.as_ref())),
        (None, Some(parent)) => Some(parent.clone()),
        (None, None) => None,
    };

    let segments = match template {
        Some(template) => {
            let media = template
                .media
                .as_deref()
                .ok_or_else(|| AdapterError::manifest("SegmentTemplate without media"))?;
            let init = template
                .initialization
                .as_deref()
                .map(|init| {
                    let url = resolve_url(&base, &expand_template(init, representation, 0, 0))?;
                    Ok::<_, AdapterError>(InitSegment {
                        url,
                        byte_range: None,
                    })
                })
                .transpose()?;

            let entries = match &template.segment_timeline {
                Some(timeline) => {
                    let period_end = period_duration.map(|d| period_start + d);
                    let mut entries =
                        timeline_entries(&template, timeline, period_start, period_end)?;
                    if let Some(elapsed) = live_elapsed {
                        let oldest = elapsed - time_shift;
                        entries.retain(|e| e.start + e.duration <= elapsed && e.start + e.duration > oldest);
                    }
                    entries
                }
                None => numbered_entries(
                    &template,
                    period_start,
                    period_duration,
                    live_elapsed,
                    time_shift,
                )?,
            };

            entries
                .into_iter()
                .map(|entry| {
                    let path = expand_template(media, representation, entry.number, entry.time);
                    Ok(TimedSegment {
                        url: resolve_url(&base, &path)?,
                        start: entry.start,
                        duration: entry.duration,
                        byte_range: None,
                        init: init.clone(),
                    })
                })
                .collect::<Result<Vec<_>, AdapterError>>()?
        }
        None if live => {
            return Err(AdapterError::unsupported(
                "dynamic representation without a SegmentTemplate",
            ));
        }
        None => {
            let duration = period_duration.ok_or_else(|| {
                AdapterError::manifest("single-file representation without a duration")
            })?;
            vec![TimedSegment {
                url: base,
                start: period_start,
                duration,
                byte_range: None,
                init: None,
            }]
        }
    };

    let target_duration = segments.iter().map(|s| s.duration).fold(0.0, f64::max);
    let refresh_interval = mpd
        .minimum_update_period
        .as_deref()
        .and_then(parse_duration)
        .unwrap_or(target_duration);
    Ok(Timeline {
        segments,
        live,
        target_duration,
        refresh_interval: Duration::try_from_secs_f64(refresh_interval.max(0.0))
            .unwrap_or(MAX_REFRESH_INTERVAL)
            .min(MAX_REFRESH_INTERVAL)
            .max(min_refresh),
    })
}

struct DashSource {
    ctx: AdapterContext,
    url: Url,
    representation_ids: Vec<String>,
    manifest: Mutex<Option<Arc<Mpd>>>,
}

impl DashSource {
    /// The cached MPD for static presentations, a fresh one otherwise.
    async fn manifest(&self) -> Result<Arc<Mpd>, AdapterError> {
        if let Some(mpd) = self.manifest.lock().as_ref().filter(|m| !m.is_dynamic()) {
            return Ok(Arc::clone(mpd));
        }
        let policy = &self.ctx.config.loader.manifest_retry;
        let text = self
            .ctx
            .fetch_text(&self.url, policy, Namespace::Dash, Stage::Manifest)
            .await?;
        let mpd = Arc::new(Mpd::parse(&text)?);
        *self.manifest.lock() = Some(Arc::clone(&mpd));
        Ok(mpd)
    }
}

#[async_trait]
impl TrackSource for DashSource {
    fn namespace(&self) -> Namespace {
        Namespace::Dash
    }

    fn timeline_stage(&self) -> Stage {
        Stage::Manifest
    }

    async fn timeline(&self, level: usize) -> Result<Timeline, AdapterError> {
        let id = self
            .representation_ids
            .get(level)
            .ok_or_else(|| AdapterError::unsupported(format!("no level {level}")))?;
        let mpd = self.manifest().await?;
        build_timeline(
            &self.url,
            &mpd,
            id,
            Utc::now(),
            self.ctx.config.loader.min_refresh_interval,
        )
    }

    fn invalidate(&self) {
        self.manifest.lock().take();
    }
}

/// Adapter for DASH manifests.
pub struct DashAdapter {
    core: SegmentedCore,
}

impl DashAdapter {
    pub(crate) fn new(ctx: AdapterContext) -> Self {
        Self {
            core: SegmentedCore::new(ctx),
        }
    }

    pub fn can_handle(url: &str) -> bool {
        let url = url.to_ascii_lowercase();
        let path = url.split('?').next().unwrap_or_default();
        path.ends_with(".mpd") || url.contains(".mpd")
    }

    pub(crate) async fn load(
        &self,
        url: &Url,
        start_position: Option<f64>,
    ) -> Result<LoadedMedia, AdapterError> {
        let ctx = self.core.ctx();
        let policy = &ctx.config.loader.manifest_retry;
        let text = ctx
            .fetch_text(url, policy, Namespace::Dash, Stage::Manifest)
            .await?;
        let mpd = Mpd::parse(&text)?;

        let set = mpd
            .current_period()?
            .primary_set()
            .ok_or_else(|| AdapterError::manifest("period has no adaptation sets"))?;
        let ranked = rank_levels(
            set.representations
                .iter()
                .map(|rep| {
                    let level = QualityLevel::new(
                        rep.bandwidth,
                        rep.width.unwrap_or(0),
                        rep.height.unwrap_or(0),
                    )
                    .with_codec(rep.codecs.clone().or_else(|| set.codecs.clone()));
                    (rep.id.clone(), level)
                })
                .collect(),
        );
        if ranked.is_empty() {
            return Err(AdapterError::manifest("adaptation set has no representations"));
        }
        let (representation_ids, levels): (Vec<String>, Vec<QualityLevel>) =
            ranked.into_iter().unzip();
        debug!(%url, levels = levels.len(), dynamic = mpd.is_dynamic(), "Parsed MPD");

        let start_level = initial_level(&ctx.config, levels.len());
        let timeline = build_timeline(
            url,
            &mpd,
            &representation_ids[start_level],
            Utc::now(),
            ctx.config.loader.min_refresh_interval,
        )?;
        if timeline.segments.is_empty() && !timeline.live {
            return Err(AdapterError::manifest("representation has no segments"));
        }

        let source = Arc::new(DashSource {
            ctx: ctx.clone(),
            url: url.clone(),
            representation_ids,
            manifest: Mutex::new(Some(Arc::new(mpd))),
        });
        self.core
            .install(source, levels, start_level, timeline, start_position)
    }

    pub(crate) fn start_loading(&self, level: usize) {
        self.core.start_loading(level);
    }

    pub(crate) fn set_quality(&self, index: usize) {
        self.core.set_quality(index);
    }

    pub(crate) fn retry_level(&self, index: usize) {
        self.core.retry_level(index);
    }

    pub(crate) fn set_auto_quality(&self, enabled: bool) {
        self.core.set_auto_quality(enabled);
    }

    pub(crate) fn current_level(&self) -> Option<usize> {
        self.core.current_level()
    }

    pub(crate) fn levels(&self) -> Vec<QualityLevel> {
        self.core.levels()
    }

    /// Start over from a freshly fetched manifest.
    pub(crate) fn recover_error(&self) {
        self.core.recover_error();
    }

    pub(crate) fn destroy(&self) {
        self.core.destroy();
    }

    pub(crate) fn latency(&self) -> f64 {
        self.core.latency()
    }

    pub(crate) fn on_sink_event(&self, event: &SinkEvent) -> bool {
        self.core.on_sink_event(event)
    }
}
