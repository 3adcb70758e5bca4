//! End-to-end playback against a local HLS fixture.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FLAKY_FAILURES, Fixture, eventually, record, states};
use vela_engine::{
    Engine, EngineConfig, EngineEvent, EventKind, HeadlessSink, MediaSink, PlaybackState,
    RecoveryKind, RecoveryPolicy, StreamConfig, codes,
};

fn autoplay_engine() -> (Engine, Arc<HeadlessSink>) {
    let sink = Arc::new(HeadlessSink::new().with_autoplay(true));
    let engine = Engine::new(sink.clone(), EngineConfig::default()).unwrap();
    (engine, sink)
}

#[tokio::test]
async fn segmented_load_reaches_playing() {
    let fixture = Fixture::start().await;
    let (engine, sink) = autoplay_engine();
    let seen = record(
        &engine,
        &[
            EventKind::StateChange,
            EventKind::QualityLevelsLoaded,
            EventKind::QualityChange,
        ],
    );

    engine
        .load(StreamConfig::new(fixture.url("master.m3u8")))
        .await
        .unwrap();
    eventually(|| engine.state() == PlaybackState::Playing).await;
    eventually(|| {
        seen.lock()
            .iter()
            .any(|e| matches!(e, EngineEvent::QualityChange(_)))
    })
    .await;

    let events = seen.lock().clone();
    assert_eq!(
        states(&events)[..3],
        [
            PlaybackState::Loading,
            PlaybackState::Buffering,
            PlaybackState::Playing
        ]
    );

    let loaded: Vec<_> = events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| match e {
            EngineEvent::QualityLevelsLoaded(levels) => Some((i, levels.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(loaded.len(), 1);
    let (position, levels) = &loaded[0];
    let bitrates: Vec<_> = levels.iter().map(|l| l.bitrate).collect();
    assert_eq!(bitrates, [400_000, 1_000_000, 2_500_000]);
    assert_eq!(levels[0].name, "240p");

    let playing = events
        .iter()
        .position(|e| matches!(e, EngineEvent::StateChange(PlaybackState::Playing)))
        .unwrap();
    assert!(*position < playing);

    let first_switch = events
        .iter()
        .find_map(|e| match e {
            EngineEvent::QualityChange(level) => Some(level.bitrate),
            _ => None,
        })
        .unwrap();
    assert_eq!(first_switch, 400_000);

    assert!(sink.appended_bytes() >= common::SEGMENT_BYTES as u64);
    assert_eq!(sink.duration(), Some(12.0));
    assert!(engine.buffer_info().ahead > 0.0);
}

#[tokio::test]
async fn dynamic_load_appends_init_and_media() {
    let fixture = Fixture::start().await;
    let (engine, sink) = autoplay_engine();
    let seen = record(&engine, &[EventKind::QualityLevelsLoaded]);

    engine
        .load(StreamConfig::new(fixture.url("dash/manifest.mpd")))
        .await
        .unwrap();
    eventually(|| engine.state() == PlaybackState::Playing).await;

    let bitrates: Vec<_> = engine.quality_levels().iter().map(|l| l.bitrate).collect();
    assert_eq!(bitrates, [800_000, 2_500_000]);
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(sink.init_level(), Some(0));
    assert_eq!(sink.duration(), Some(8.0));
    eventually(|| sink.buffered().last().is_some_and(|r| r.end == 8.0)).await;
}

#[tokio::test]
async fn later_load_supersedes_pending_one() {
    let fixture = Fixture::start().await;
    let (engine, _sink) = autoplay_engine();
    let seen = record(&engine, &[EventKind::QualityLevelsLoaded]);

    let first = tokio::spawn({
        let engine = engine.clone();
        let url = fixture.url("slow/master.m3u8");
        async move { engine.load(StreamConfig::new(url)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine
        .load(StreamConfig::new(fixture.url("master.m3u8")))
        .await
        .unwrap();
    assert!(first.await.unwrap().is_ok());

    eventually(|| engine.state() == PlaybackState::Playing).await;
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(engine.quality_levels().len(), 3);
}

#[tokio::test]
async fn unload_returns_to_idle() {
    let fixture = Fixture::start().await;
    let (engine, sink) = autoplay_engine();
    engine
        .load(StreamConfig::new(fixture.url("master.m3u8")))
        .await
        .unwrap();
    eventually(|| engine.state() == PlaybackState::Playing).await;

    engine.unload();
    assert_eq!(engine.state(), PlaybackState::Idle);
    assert!(engine.quality_levels().is_empty());
    assert!(sink.duration().is_none());
}

#[tokio::test]
async fn manual_quality_survives_ticks() {
    let fixture = Fixture::start().await;
    let (engine, _sink) = autoplay_engine();
    engine
        .load(StreamConfig::new(fixture.url("master.m3u8")))
        .await
        .unwrap();
    eventually(|| engine.state() == PlaybackState::Playing).await;

    assert!(engine.set_quality(2));
    assert!(!engine.is_auto_quality());
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(engine.current_quality().unwrap().bitrate, 2_500_000);

    engine.set_auto_quality(true);
    assert!(engine.is_auto_quality());
}

#[tokio::test]
async fn stats_are_published_on_tick() {
    let fixture = Fixture::start().await;
    let sink = Arc::new(HeadlessSink::new().with_autoplay(true));
    let config = EngineConfig::default().with_tick_interval(Duration::from_millis(50));
    let engine = Engine::new(sink, config).unwrap();
    let seen = record(&engine, &[EventKind::Stats]);

    engine
        .load(StreamConfig::new(fixture.url("master.m3u8")))
        .await
        .unwrap();
    eventually(|| !seen.lock().is_empty()).await;

    let stats = engine.stats();
    assert_eq!(stats.duration, 12.0);
    assert!(stats.quality.is_some());
    assert_eq!(stats.latency, 0.0);
}

#[tokio::test]
async fn direct_sources_play_without_fetching() {
    let fixture = Fixture::start().await;
    let (engine, _sink) = autoplay_engine();
    engine
        .load(StreamConfig::new(fixture.url("movie.mp4")))
        .await
        .unwrap();
    eventually(|| engine.state() == PlaybackState::Playing).await;

    let levels = engine.quality_levels();
    assert_eq!(levels.len(), 1);
    assert_eq!(levels[0].name, "720p");
}

#[tokio::test]
async fn missing_manifest_fails_the_load() {
    let fixture = Fixture::start().await;
    let (engine, _sink) = autoplay_engine();
    let seen = record(&engine, &[EventKind::Error]);

    let err = engine
        .load(StreamConfig::new(fixture.url("missing.m3u8")))
        .await
        .unwrap_err();
    assert_eq!(err.code, codes::LOAD_ERROR);
    assert!(err.fatal);
    assert!(err.message.contains("404"));
    assert_eq!(engine.state(), PlaybackState::Error);

    let fatal = seen
        .lock()
        .iter()
        .filter(|e| matches!(e, EngineEvent::Error(error) if error.fatal))
        .count();
    assert_eq!(fatal, 1);
}

#[tokio::test]
async fn destroy_detaches_everything() {
    let fixture = Fixture::start().await;
    let (engine, _sink) = autoplay_engine();
    let seen = record(&engine, &[EventKind::StateChange]);
    engine
        .load(StreamConfig::new(fixture.url("master.m3u8")))
        .await
        .unwrap();
    eventually(|| engine.state() == PlaybackState::Playing).await;

    engine.destroy();
    assert_eq!(engine.state(), PlaybackState::Idle);
    assert_eq!(engine.events().listener_count(EventKind::StateChange), 0);
    let before = seen.lock().len();

    let err = engine
        .load(StreamConfig::new(fixture.url("master.m3u8")))
        .await
        .unwrap_err();
    assert_eq!(err.code, codes::ENGINE_DESTROYED);
    assert_eq!(seen.lock().len(), before);
}

fn planned(events: &[EngineEvent]) -> Vec<RecoveryKind> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::RecoveryPlanned(action) => Some(action.kind),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn flaky_fragments_recover_through_the_ladder() {
    let fixture = Fixture::start().await;
    let (engine, _sink) = autoplay_engine();
    let seen = record(
        &engine,
        &[
            EventKind::Error,
            EventKind::RecoveryPlanned,
            EventKind::Recovered,
        ],
    );

    engine
        .load(StreamConfig::new(fixture.url("flaky/media/low/index.m3u8")))
        .await
        .unwrap();
    eventually(|| {
        seen.lock()
            .iter()
            .any(|e| matches!(e, EngineEvent::Recovered))
    })
    .await;
    eventually(|| engine.state() == PlaybackState::Playing).await;

    let events = seen.lock().clone();
    assert_eq!(
        planned(&events),
        [RecoveryKind::Retry, RecoveryKind::Retry, RecoveryKind::SeekPast]
    );
    let codes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Error(error) => Some(error.code.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(codes, ["HLS_FRAG_LOAD_ERROR"; FLAKY_FAILURES as usize]);
    assert!(matches!(events.last(), Some(EngineEvent::Recovered)));
    assert!(!engine.is_recovery_pending());
}

#[tokio::test]
async fn missing_fragments_exhaust_recovery() {
    let fixture = Fixture::start().await;
    let sink = Arc::new(HeadlessSink::new().with_autoplay(true));
    let recovery = RecoveryPolicy {
        fragment_retries: 1,
        fragment_seek_ceiling: 1,
        fragment_retry_delay: Duration::from_millis(20),
        downgrade_delay: Duration::from_millis(20),
        max_total_attempts: 6,
        ..RecoveryPolicy::default()
    };
    let engine = Engine::new(sink, EngineConfig::default().with_recovery(recovery)).unwrap();
    let seen = record(&engine, &[EventKind::RecoveryPlanned]);

    engine
        .load(StreamConfig::new(fixture.url("broken/master.m3u8")))
        .await
        .unwrap();
    eventually(|| planned(&seen.lock()).last() == Some(&RecoveryKind::Fatal)).await;

    assert_eq!(engine.state(), PlaybackState::Error);
    assert!(!engine.is_recovery_pending());
    let kinds = planned(&seen.lock());
    assert_eq!(kinds.len(), 7);
    assert_eq!(kinds[0], RecoveryKind::Retry);
    // The lowest level is already loading, so every downgrade retries it.
    assert!(
        kinds[1..6]
            .iter()
            .all(|kind| *kind == RecoveryKind::DowngradeQuality)
    );
}

#[tokio::test]
async fn replaced_source_events_do_not_leak_into_next_load() {
    let fixture = Fixture::start().await;
    let (engine, _sink) = autoplay_engine();
    engine
        .load(StreamConfig::new(fixture.url("first.mp4")))
        .await
        .unwrap();

    let seen = record(
        &engine,
        &[EventKind::StateChange, EventKind::QualityLevelsLoaded],
    );
    let (loaded, midway) = tokio::join!(
        engine.load(StreamConfig::new(fixture.url("slow/master.m3u8"))),
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            engine.state()
        }
    );
    loaded.unwrap();
    assert_eq!(midway, PlaybackState::Loading);
    eventually(|| engine.state() == PlaybackState::Playing).await;

    let events = seen.lock().clone();
    let levels = events
        .iter()
        .position(|e| matches!(e, EngineEvent::QualityLevelsLoaded(_)))
        .unwrap();
    assert!(matches!(&events[levels], EngineEvent::QualityLevelsLoaded(l) if l.len() == 3));
    assert!(
        states(&events[..levels])
            .iter()
            .all(|state| *state == PlaybackState::Loading)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn state_changes_arrive_in_commit_order() {
    let fixture = Fixture::start().await;
    let (engine, sink) = autoplay_engine();
    engine
        .load(StreamConfig::new(fixture.url("movie.mp4")))
        .await
        .unwrap();
    eventually(|| engine.state() == PlaybackState::Playing).await;
    let seen = record(&engine, &[EventKind::StateChange]);

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let engine = engine.clone();
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                for i in 0..200u32 {
                    match (worker + i) % 3 {
                        0 => engine.pause(),
                        1 => {
                            let _ = engine.play().await;
                        }
                        _ => sink.set_current_time(f64::from(i % 10)),
                    }
                    if i % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let changes = states(&seen.lock());
    assert!(!changes.is_empty());
    assert_eq!(changes.last(), Some(&engine.state()));
    assert!(changes.windows(2).all(|pair| pair[0] != pair[1]));
}
