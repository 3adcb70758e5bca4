// HLS Adapter: master/media playlist handling on top of the segment loader.
//
// A master playlist yields one level per non-I-frame variant; a bare media
// playlist becomes a single level. Live playlists are re-fetched at
// target-duration cadence and anchored by media sequence number so segment
// times stay stable across refreshes and level switches.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use m3u8_rs::{MediaPlaylist, Playlist, parse_playlist_res};
use parking_lot::Mutex;
use tracing::{debug, warn};
use url::Url;

use super::loader::{InitSegment, SegmentedCore, TimedSegment, Timeline, TrackSource};
use super::{AdapterContext, LoadedMedia, initial_level, resolve_url};
use crate::error::{AdapterError, Namespace, Stage};
use crate::http::ByteRange;
use crate::quality::{QualityLevel, rank_levels};
use crate::sink::SinkEvent;

/// Sequence numbers kept behind the oldest live segment.
const ANCHOR_HISTORY: u64 = 64;

fn parse(text: &str) -> Result<Playlist, AdapterError> {
    parse_playlist_res(text.as_bytes())
        .map_err(|e| AdapterError::manifest(format!("failed to parse playlist: {e}")))
}

/// `EXT-X-MAP` declared before the first segment ends up in `unknown_tags`.
fn playlist_level_map(playlist: &MediaPlaylist) -> Option<m3u8_rs::Map> {
    let ext = playlist
        .unknown_tags
        .iter()
        .rev()
        .find(|t| t.tag == "X-MAP")?;
    let rest = ext.rest.as_deref()?;

    // Split on commas outside quotes.
    let mut parts: Vec<&str> = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(rest[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(rest[start..].trim());

    let mut uri = None;
    let mut byte_range = None;
    for (key, value) in parts.into_iter().filter_map(|part| part.split_once('=')) {
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        if key.trim().eq_ignore_ascii_case("URI") {
            uri = Some(value.to_string());
        } else if key.trim().eq_ignore_ascii_case("BYTERANGE") {
            let (length, offset) = value.split_once('@').unwrap_or((value, ""));
            if let Ok(length) = length.trim().parse::<u64>() {
                byte_range = Some(m3u8_rs::ByteRange {
                    length,
                    offset: offset.trim().parse::<u64>().ok(),
                });
            }
        }
    }

    Some(m3u8_rs::Map {
        uri: uri?,
        byte_range,
        other_attributes: HashMap::new(),
    })
}

fn init_segment(base: &Url, map: &m3u8_rs::Map) -> Result<InitSegment, AdapterError> {
    Ok(InitSegment {
        url: resolve_url(base, &map.uri)?,
        byte_range: map.byte_range.as_ref().map(|range| ByteRange {
            offset: range.offset.unwrap_or(0),
            length: range.length,
        }),
    })
}

/// Start times for a window of segments beginning at `first_msn`.
///
/// Known sequence numbers pin the window; an unknown window continues after
/// the last known segment.
fn place_segments(
    anchors: &mut BTreeMap<u64, (f64, f64)>,
    first_msn: u64,
    durations: &[f64],
) -> Vec<f64> {
    let mut offset = 0.0;
    let mut base = None;
    for (i, duration) in durations.iter().enumerate() {
        if let Some((start, _)) = anchors.get(&(first_msn + i as u64)) {
            base = Some(start - offset);
            break;
        }
        offset += duration;
    }
    let base = base.unwrap_or_else(|| {
        anchors
            .last_key_value()
            .map_or(0.0, |(_, (start, duration))| start + duration)
    });

    let mut starts = Vec::with_capacity(durations.len());
    let mut cursor = base;
    for (i, duration) in durations.iter().enumerate() {
        starts.push(cursor);
        anchors.insert(first_msn + i as u64, (cursor, *duration));
        cursor += duration;
    }
    *anchors = anchors.split_off(&first_msn.saturating_sub(ANCHOR_HISTORY));
    starts
}

struct HlsSource {
    ctx: AdapterContext,
    variants: Vec<Url>,
    anchors: Mutex<BTreeMap<u64, (f64, f64)>>,
}

impl HlsSource {
    fn timeline_from(&self, url: &Url, playlist: &MediaPlaylist) -> Result<Timeline, AdapterError> {
        let live = !playlist.end_list;
        let level_map = playlist_level_map(playlist);
        let durations: Vec<f64> = playlist
            .segments
            .iter()
            .map(|s| f64::from(s.duration))
            .collect();
        let starts = if live {
            place_segments(&mut self.anchors.lock(), playlist.media_sequence, &durations)
        } else {
            durations
                .iter()
                .scan(0.0, |cursor, duration| {
                    let start = *cursor;
                    *cursor += duration;
                    Some(start)
                })
                .collect()
        };

        let mut segments = Vec::with_capacity(playlist.segments.len());
        let mut init: Option<InitSegment> = level_map
            .as_ref()
            .map(|map| init_segment(url, map))
            .transpose()?;
        let mut last_uri: Option<&str> = None;
        let mut last_range: Option<(&str, u64)> = None;

        for (idx, segment) in playlist.segments.iter().enumerate() {
            let msn = playlist.media_sequence + idx as u64;
            if let Some(map) = &segment.map {
                init = Some(init_segment(url, map)?);
            }

            let uri = if segment.uri.trim().is_empty() {
                segment.byte_range.as_ref().and(last_uri).unwrap_or("")
            } else {
                last_uri = Some(segment.uri.as_str());
                segment.uri.as_str()
            };
            if uri.trim().is_empty() {
                warn!(msn, "Skipping segment with empty URI");
                continue;
            }

            let byte_range = match &segment.byte_range {
                Some(range) => {
                    let offset = range.offset.or_else(|| {
                        last_range
                            .filter(|(last, _)| *last == uri)
                            .map(|(_, end)| end)
                    });
                    let Some(offset) = offset else {
                        warn!(
                            msn,
                            uri,
                            "Skipping segment with BYTERANGE missing offset and no prior range to infer from"
                        );
                        last_range = None;
                        continue;
                    };
                    last_range = Some((uri, offset.saturating_add(range.length)));
                    Some(ByteRange {
                        offset,
                        length: range.length,
                    })
                }
                None => {
                    last_range = None;
                    None
                }
            };

            segments.push(TimedSegment {
                url: resolve_url(url, uri)?,
                start: starts[idx],
                duration: durations[idx],
                byte_range,
                init: init.clone(),
            });
        }

        let refresh_interval = Duration::from_secs(playlist.target_duration)
            .max(self.ctx.config.loader.min_refresh_interval);
        Ok(Timeline {
            segments,
            live,
            target_duration: playlist.target_duration as f64,
            refresh_interval,
        })
    }
}

#[async_trait]
impl TrackSource for HlsSource {
    fn namespace(&self) -> Namespace {
        Namespace::Hls
    }

    fn timeline_stage(&self) -> Stage {
        Stage::Level
    }

    async fn timeline(&self, level: usize) -> Result<Timeline, AdapterError> {
        let url = self
            .variants
            .get(level)
            .ok_or_else(|| AdapterError::unsupported(format!("no level {level}")))?;
        let policy = &self.ctx.config.loader.manifest_retry;
        let text = self
            .ctx
            .fetch_text(url, policy, Namespace::Hls, Stage::Level)
            .await?;
        match parse(&text)? {
            Playlist::MediaPlaylist(playlist) => self.timeline_from(url, &playlist),
            Playlist::MasterPlaylist(_) => Err(AdapterError::manifest(
                "expected a media playlist, got a master playlist",
            )),
        }
    }
}

/// Adapter for HLS manifests.
pub struct HlsAdapter {
    core: SegmentedCore,
}

impl HlsAdapter {
    pub(crate) fn new(ctx: AdapterContext) -> Self {
        Self {
            core: SegmentedCore::new(ctx),
        }
    }

    pub fn can_handle(url: &str) -> bool {
        let url = url.to_ascii_lowercase();
        let path = url.split('?').next().unwrap_or_default();
        path.ends_with(".m3u8")
            || path.ends_with(".m3u")
            || url.contains(".m3u8")
            || url.contains("/hls/")
    }

    pub(crate) async fn load(
        &self,
        url: &Url,
        start_position: Option<f64>,
    ) -> Result<LoadedMedia, AdapterError> {
        let ctx = self.core.ctx();
        let policy = &ctx.config.loader.manifest_retry;
        let text = ctx
            .fetch_text(url, policy, Namespace::Hls, Stage::Manifest)
            .await?;

        let (variants, levels, media) = match parse(&text)? {
            Playlist::MasterPlaylist(master) => {
                let mut ranked = Vec::new();
                for variant in master.variants.iter().filter(|v| !v.is_i_frame) {
                    let variant_url = match resolve_url(url, &variant.uri) {
                        Ok(variant_url) => variant_url,
                        Err(e) => {
                            warn!(uri = %variant.uri, error = %e, "Skipping variant");
                            continue;
                        }
                    };
                    let (width, height) = variant.resolution.as_ref().map_or((0, 0), |r| {
                        (
                            u32::try_from(r.width).unwrap_or(u32::MAX),
                            u32::try_from(r.height).unwrap_or(u32::MAX),
                        )
                    });
                    let level = QualityLevel::new(variant.bandwidth, width, height)
                        .with_codec(variant.codecs.clone());
                    ranked.push((variant_url, level));
                }
                if ranked.is_empty() {
                    return Err(AdapterError::manifest(
                        "master playlist has no playable variants",
                    ));
                }
                let (variants, levels): (Vec<Url>, Vec<QualityLevel>) =
                    rank_levels(ranked).into_iter().unzip();
                (variants, levels, None)
            }
            Playlist::MediaPlaylist(playlist) => {
                let level = QualityLevel::new(0, 0, 0);
                (vec![url.clone()], vec![level], Some(playlist))
            }
        };
        debug!(%url, levels = levels.len(), "Parsed HLS manifest");

        let source = Arc::new(HlsSource {
            ctx: ctx.clone(),
            variants,
            anchors: Mutex::new(BTreeMap::new()),
        });
        let start_level = initial_level(&ctx.config, levels.len());
        let timeline = match media {
            Some(playlist) => source.timeline_from(url, &playlist)?,
            None => source.timeline(start_level).await?,
        };
        if timeline.segments.is_empty() {
            return Err(AdapterError::manifest("media playlist has no segments"));
        }

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

#[cfg(test)]
mod tests {
    use super::*;

    fn media(text: &str) -> MediaPlaylist {
        match parse(text).unwrap() {
            Playlist::MediaPlaylist(playlist) => playlist,
            Playlist::MasterPlaylist(_) => panic!("expected media playlist"),
        }
    }

    fn source() -> HlsSource {
        let (events, _) = tokio::sync::mpsc::unbounded_channel();
        let config = crate::config::EngineConfig::default();
        HlsSource {
            ctx: AdapterContext {
                sink: Arc::new(crate::sink::HeadlessSink::new()),
                http: crate::http::create_client(&config.http).unwrap(),
                config: Arc::new(config),
                headers: Default::default(),
                low_latency: false,
                events,
                token: Default::default(),
            },
            variants: Vec::new(),
            anchors: Mutex::new(BTreeMap::new()),
        }
    }

    fn base() -> Url {
        Url::parse("http://cdn.example/live/720p/index.m3u8").unwrap()
    }

    #[test]
    fn sniffs_hls_urls() {
        assert!(HlsAdapter::can_handle("http://x/a/b.m3u8"));
        assert!(HlsAdapter::can_handle("http://x/a/b.M3U?token=1"));
        assert!(HlsAdapter::can_handle("http://x/hls/123"));
        assert!(!HlsAdapter::can_handle("http://x/a/b.mpd"));
        assert!(!HlsAdapter::can_handle("http://x/a/b.m3u.bak"));
    }

    #[test]
    fn vod_playlist_builds_contiguous_timeline() {
        let playlist = media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n\
             #EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n#EXTINF:2.5,\nseg2.ts\n#EXT-X-ENDLIST\n",
        );
        let timeline = source().timeline_from(&base(), &playlist).unwrap();
        assert!(!timeline.live);
        let starts: Vec<f64> = timeline.segments.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0.0, 4.0, 8.0]);
        assert_eq!(timeline.end(), 10.5);
        assert_eq!(
            timeline.segments[1].url.as_str(),
            "http://cdn.example/live/720p/seg1.ts"
        );
        assert_eq!(timeline.refresh_interval, Duration::from_secs(4));
    }

    #[test]
    fn byte_range_offsets_are_inferred() {
        let playlist = media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n\
             #EXTINF:2.0,\n#EXT-X-BYTERANGE:1000@0\nall.ts\n\
             #EXTINF:2.0,\n#EXT-X-BYTERANGE:500\nall.ts\n\
             #EXTINF:2.0,\n#EXT-X-BYTERANGE:700\nother.ts\n\
             #EXTINF:2.0,\n#EXT-X-BYTERANGE:300@2000\nother.ts\n#EXT-X-ENDLIST\n",
        );
        let timeline = source().timeline_from(&base(), &playlist).unwrap();
        let ranges: Vec<_> = timeline
            .segments
            .iter()
            .map(|s| s.byte_range.map(|r| (r.offset, r.length)))
            .collect();
        // The third segment has no offset and a different URI: skipped.
        assert_eq!(
            ranges,
            vec![Some((0, 1000)), Some((1000, 500)), Some((2000, 300))]
        );
        // Skipped segments still occupy their time slot.
        assert_eq!(timeline.segments[2].start, 6.0);
    }

    #[test]
    fn map_before_first_segment_applies_to_all() {
        let playlist = media(
            "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n\
             #EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"\n\
             #EXTINF:2.0,\nseg0.m4s\n#EXTINF:2.0,\nseg1.m4s\n#EXT-X-ENDLIST\n",
        );
        let timeline = source().timeline_from(&base(), &playlist).unwrap();
        let init = timeline.segments[1].init.clone().unwrap();
        assert_eq!(init.url.as_str(), "http://cdn.example/live/720p/init.mp4");
        assert_eq!(
            init.byte_range,
            Some(ByteRange {
                offset: 0,
                length: 720
            })
        );
        assert_eq!(timeline.segments[0].init, timeline.segments[1].init);
    }

    #[test]
    fn live_windows_stay_anchored_across_refreshes() {
        let source = source();
        let first = media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:100\n\
             #EXTINF:2.0,\na.ts\n#EXTINF:2.0,\nb.ts\n#EXTINF:2.0,\nc.ts\n",
        );
        let timeline = source.timeline_from(&base(), &first).unwrap();
        assert!(timeline.live);
        assert_eq!(timeline.end(), 6.0);

        let second = media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:102\n\
             #EXTINF:2.0,\nc.ts\n#EXTINF:2.0,\nd.ts\n#EXTINF:2.0,\ne.ts\n",
        );
        let timeline = source.timeline_from(&base(), &second).unwrap();
        let starts: Vec<f64> = timeline.segments.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![4.0, 6.0, 8.0]);
    }

    #[test]
    fn unknown_live_window_continues_after_last_anchor() {
        let mut anchors = BTreeMap::new();
        place_segments(&mut anchors, 10, &[2.0, 2.0]);
        let starts = place_segments(&mut anchors, 50, &[3.0, 3.0]);
        assert_eq!(starts, vec![4.0, 7.0]);
        assert!(anchors.contains_key(&10));

        place_segments(&mut anchors, 500, &[1.0]);
        assert!(!anchors.contains_key(&10));
    }
}
