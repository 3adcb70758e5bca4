// Probe: drives an engine against a HeadlessSink in real time and reports
// what happens.

use std::sync::Arc;
use std::time::{Duration, Instant};

use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use tracing::{info, warn};
use vela_engine::{
    Engine, EngineConfig, EngineEvent, EventKind, HeadlessSink, Protocol, RecoveryKind,
    StreamConfig,
};

use crate::cli::ProbeArgs;
use crate::error::{AppError, Result};
use crate::output::{ProbeSummary, StopReason, print_event, print_summary};

// How often the virtual clock of the sink is advanced.
const CLOCK_STEP: Duration = Duration::from_millis(100);

pub async fn run(args: ProbeArgs) -> Result<()> {
    let mut sink = HeadlessSink::new().with_autoplay(true);
    if let Some(surface) = args.surface {
        sink = sink.with_surface(surface);
    }
    let sink = Arc::new(sink);

    let mut config = EngineConfig::default();
    if let Some(user_agent) = &args.user_agent {
        config.http.user_agent = user_agent.clone();
    }
    let engine = Engine::new(sink.clone(), config)?;

    let (tx, mut events) = mpsc::unbounded_channel::<EngineEvent>();
    for kind in EventKind::iter() {
        let tx = tx.clone();
        let _ = engine.on(kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }
    drop(tx);

    let protocol = Protocol::resolve(args.protocol, &args.url);
    let mut stream = StreamConfig::new(&args.url).with_protocol(args.protocol);
    if let Some(start) = args.start {
        stream = stream.with_start_position(start);
    }
    if args.low_latency {
        stream = stream.with_low_latency(true);
    }
    for (name, value) in &args.headers {
        stream = stream.with_header(name, value);
    }

    info!(url = %args.url, %protocol, "Probing stream");
    let started = Instant::now();
    let mut summary = ProbeSummary::new(&args.url, protocol);

    if let Err(e) = engine.load(stream).await {
        warn!(error = %e, "Initial load failed");
    }
    if let Some(index) = args.quality
        && !engine.set_quality(index)
    {
        let available = engine.quality_levels().len();
        engine.destroy();
        return Err(AppError::InvalidInput(format!(
            "quality level {index} does not exist ({available} available)"
        )));
    }

    let deadline = (args.duration > 0).then(|| started + Duration::from_secs(args.duration));
    let mut clock = tokio::time::interval(CLOCK_STEP);
    let mut last_step = Instant::now();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let reason = loop {
        tokio::select! {
            _ = &mut ctrl_c => break StopReason::Interrupted,
            _ = clock.tick() => {
                let now = Instant::now();
                sink.advance(now - last_step);
                last_step = now;
                if deadline.is_some_and(|deadline| now >= deadline) {
                    break StopReason::Elapsed;
                }
            }
            Some(event) = events.recv() => {
                print_event(&event, started.elapsed(), args.json)?;
                summary.observe(&event);
                match event {
                    EngineEvent::Ended => break StopReason::Ended,
                    EngineEvent::RecoveryPlanned(action) if action.kind == RecoveryKind::Fatal => {
                        warn!(reason = %action.reason, "Recovery exhausted");
                        break StopReason::Failed;
                    }
                    _ => {}
                }
            }
        }
    };

    summary.stop_reason = reason;
    summary.elapsed_secs = started.elapsed().as_secs_f64();
    summary.stats = engine.stats();
    engine.destroy();
    print_summary(&summary, args.json)?;

    match reason {
        StopReason::Failed => Err(AppError::PlaybackFailed(
            summary
                .last_error
                .unwrap_or_else(|| "unrecoverable error".to_string()),
        )),
        _ => Ok(()),
    }
}
