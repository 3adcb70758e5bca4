//! Local HTTP fixture serving small on-demand HLS and DASH ladders.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use vela_engine::{Engine, EngineEvent, EventKind, PlaybackState};

pub const SEGMENT_BYTES: usize = 4096;

/// Requests of the first `/flaky/` segment that fail before it is served.
pub const FLAKY_FAILURES: u32 = 3;

const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720
media/high/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=400000,RESOLUTION=426x240
media/low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=854x480
media/mid/index.m3u8
";

const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:4.0,
seg0.ts
#EXTINF:4.0,
seg1.ts
#EXTINF:4.0,
seg2.ts
#EXT-X-ENDLIST
";

const MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT8S" minBufferTime="PT2S">
  <Period id="0">
    <AdaptationSet contentType="video" mimeType="video/mp4" codecs="avc1.64001f">
      <SegmentTemplate media="$RepresentationID$/seg-$Number$.m4s" initialization="$RepresentationID$/init.mp4" timescale="1000" duration="4000" startNumber="1"/>
      <Representation id="v720" bandwidth="2500000" width="1280" height="720"/>
      <Representation id="v360" bandwidth="800000" width="640" height="360"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

const PLAYLIST_TYPE: &str = "application/vnd.apple.mpegurl";

pub struct Fixture {
    base: String,
    task: JoinHandle<()>,
}

impl Fixture {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let failures = Arc::new(AtomicU32::new(0));
        let app = Router::new()
            .route("/master.m3u8", get(master))
            .route("/broken/master.m3u8", get(master))
            .route("/broken/media/{variant}/{file}", get(broken_media))
            .route("/flaky/media/{variant}/{file}", get(flaky_media))
            .route("/slow/master.m3u8", get(slow_master))
            .route("/media/{variant}/{file}", get(media))
            .route("/slow/media/{variant}/{file}", get(media))
            .route("/dash/manifest.mpd", get(mpd))
            .route("/dash/{representation}/{file}", get(dash_media))
            .with_state(failures);
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn master() -> Response {
    ([(header::CONTENT_TYPE, PLAYLIST_TYPE)], MASTER).into_response()
}

async fn slow_master() -> Response {
    tokio::time::sleep(Duration::from_millis(500)).await;
    master().await
}

async fn media(Path((variant, file)): Path<(String, String)>) -> Response {
    if !matches!(variant.as_str(), "low" | "mid" | "high") {
        return StatusCode::NOT_FOUND.into_response();
    }
    if file == "index.m3u8" {
        return ([(header::CONTENT_TYPE, PLAYLIST_TYPE)], MEDIA).into_response();
    }
    if file.starts_with("seg") && file.ends_with(".ts") {
        return vec![0u8; SEGMENT_BYTES].into_response();
    }
    StatusCode::NOT_FOUND.into_response()
}

/// Playlists load, every segment is missing.
async fn broken_media(Path((variant, file)): Path<(String, String)>) -> Response {
    if file == "index.m3u8" {
        return media(Path((variant, file))).await;
    }
    StatusCode::NOT_FOUND.into_response()
}

/// The first segment fails `FLAKY_FAILURES` times, then loads.
async fn flaky_media(
    State(failures): State<Arc<AtomicU32>>,
    Path((variant, file)): Path<(String, String)>,
) -> Response {
    if file == "seg0.ts" && failures.fetch_add(1, Ordering::SeqCst) < FLAKY_FAILURES {
        return StatusCode::NOT_FOUND.into_response();
    }
    media(Path((variant, file))).await
}

async fn mpd() -> Response {
    ([(header::CONTENT_TYPE, "application/dash+xml")], MPD).into_response()
}

async fn dash_media(Path((representation, file)): Path<(String, String)>) -> Response {
    if !matches!(representation.as_str(), "v720" | "v360") {
        return StatusCode::NOT_FOUND.into_response();
    }
    match file.as_str() {
        "init.mp4" => vec![1u8; 512].into_response(),
        "seg-1.m4s" | "seg-2.m4s" => vec![0u8; SEGMENT_BYTES].into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Collects every event of the given kinds in arrival order.
pub fn record(engine: &Engine, kinds: &[EventKind]) -> Arc<Mutex<Vec<EngineEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for &kind in kinds {
        let seen = Arc::clone(&seen);
        let _ = engine.on(kind, move |event| seen.lock().push(event.clone()));
    }
    seen
}

pub fn states(events: &[EngineEvent]) -> Vec<PlaybackState> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::StateChange(state) => Some(*state),
            _ => None,
        })
        .collect()
}

/// Poll until `check` holds, failing the test after a few seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
