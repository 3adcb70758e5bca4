use std::io::{self, Write};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use vela_engine::{EngineEvent, EngineStats, Protocol, RecoveryKind};

/// Why a probe run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    Ended,
    Elapsed,
    Interrupted,
    Failed,
}

/// Totals accumulated over one probe run.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeSummary {
    pub url: String,
    pub protocol: Protocol,
    pub stop_reason: StopReason,
    pub elapsed_secs: f64,
    pub levels: usize,
    pub quality_switches: u32,
    pub non_fatal_errors: u32,
    pub fatal_errors: u32,
    pub recovery_attempts: u32,
    pub recoveries: u32,
    pub last_error: Option<String>,
    pub stats: EngineStats,
}

impl ProbeSummary {
    pub fn new(url: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            url: url.into(),
            protocol,
            stop_reason: StopReason::Elapsed,
            elapsed_secs: 0.0,
            levels: 0,
            quality_switches: 0,
            non_fatal_errors: 0,
            fatal_errors: 0,
            recovery_attempts: 0,
            recoveries: 0,
            last_error: None,
            stats: EngineStats::default(),
        }
    }

    pub fn observe(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::QualityLevelsLoaded(levels) => self.levels = levels.len(),
            EngineEvent::QualityChange(_) => self.quality_switches += 1,
            EngineEvent::Error(error) if error.fatal => {
                self.fatal_errors += 1;
                self.last_error = Some(error.to_string());
            }
            EngineEvent::Error(_) => self.non_fatal_errors += 1,
            EngineEvent::RecoveryPlanned(action) if action.kind != RecoveryKind::Fatal => {
                self.recovery_attempts += 1;
            }
            EngineEvent::Recovered => self.recoveries += 1,
            _ => {}
        }
    }
}

/// JSON form of an engine event.
pub fn event_json(event: &EngineEvent) -> Value {
    match event {
        EngineEvent::StateChange(state) => json!({ "event": "stateChange", "state": state }),
        EngineEvent::QualityLevelsLoaded(levels) => {
            json!({ "event": "qualityLevelsLoaded", "levels": levels })
        }
        EngineEvent::QualityChange(level) => json!({ "event": "qualityChange", "level": level }),
        EngineEvent::Stats(stats) => json!({ "event": "stats", "stats": stats }),
        EngineEvent::Error(error) => json!({
            "event": "error",
            "code": error.code,
            "message": error.message,
            "fatal": error.fatal,
        }),
        EngineEvent::RecoveryPlanned(action) => json!({
            "event": "recoveryPlanned",
            "action": action.kind.to_string(),
            "delayMs": action.delay.as_millis() as u64,
            "reason": action.reason,
        }),
        EngineEvent::BufferUpdate(buffer) => json!({ "event": "bufferUpdate", "buffer": buffer }),
        EngineEvent::TimeUpdate {
            current_time,
            duration,
        } => json!({
            "event": "timeUpdate",
            "currentTime": current_time,
            "duration": duration,
        }),
        EngineEvent::Ended => json!({ "event": "ended" }),
        EngineEvent::Recovered => json!({ "event": "recovered" }),
    }
}

/// One-line human description, or `None` for high-frequency events.
pub fn describe(event: &EngineEvent) -> Option<String> {
    let line = match event {
        EngineEvent::StateChange(state) => format!("state      {state}"),
        EngineEvent::QualityLevelsLoaded(levels) => {
            let names: Vec<_> = levels
                .iter()
                .map(|l| format!("{} ({} kbps)", l.name, l.bitrate / 1000))
                .collect();
            format!("levels     {}", names.join(", "))
        }
        EngineEvent::QualityChange(level) => {
            format!("quality    #{} {} ({} kbps)", level.index, level.name, level.bitrate / 1000)
        }
        EngineEvent::Stats(stats) => format!(
            "stats      t={:.1}s buffer={:.1}s bitrate={}kbps speed={:.0}kbps dropped={}",
            stats.current_time,
            stats.buffer.ahead,
            stats.bitrate / 1000,
            stats.download_speed / 1000.0,
            stats.dropped_frames
        ),
        EngineEvent::Error(error) => {
            let severity = if error.fatal { "fatal" } else { "warning" };
            format!("error      {severity} {error}")
        }
        EngineEvent::RecoveryPlanned(action) => format!(
            "recovery   {} in {}ms ({})",
            action.kind,
            action.delay.as_millis(),
            action.reason
        ),
        EngineEvent::Ended => "ended".to_string(),
        EngineEvent::Recovered => "recovered".to_string(),
        EngineEvent::BufferUpdate(_) | EngineEvent::TimeUpdate { .. } => return None,
    };
    Some(line)
}

pub fn print_event(event: &EngineEvent, at: Duration, as_json: bool) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    if as_json {
        let mut value = event_json(event);
        value["at"] = json!(at.as_secs_f64());
        writeln!(stdout, "{value}")
    } else if let Some(line) = describe(event) {
        writeln!(stdout, "{:>8.2}s  {line}", at.as_secs_f64())
    } else {
        Ok(())
    }
}

pub fn print_summary(summary: &ProbeSummary, as_json: bool) -> serde_json::Result<()> {
    if as_json {
        println!("{}", serde_json::to_string(&json!({ "summary": summary }))?);
        return Ok(());
    }

    let stats = &summary.stats;
    println!();
    println!("URL:            {}", summary.url);
    println!("Protocol:       {}", summary.protocol);
    println!("Stopped:        {} after {:.1}s", summary.stop_reason, summary.elapsed_secs);
    println!("Levels:         {}", summary.levels);
    if let Some(quality) = &stats.quality {
        println!("Final quality:  {} ({} kbps)", quality.name, quality.bitrate / 1000);
    }
    println!("Switches:       {}", summary.quality_switches);
    println!("Position:       {:.1}s / {:.1}s", stats.current_time, stats.duration);
    println!("Buffer ahead:   {:.1}s", stats.buffer.ahead);
    println!("Download speed: {:.0} kbps", stats.download_speed / 1000.0);
    println!(
        "Errors:         {} fatal, {} recovery attempts, {} recovered from, {} warnings",
        summary.fatal_errors,
        summary.recovery_attempts,
        summary.recoveries,
        summary.non_fatal_errors
    );
    if let Some(error) = &summary.last_error {
        println!("Last error:     {error}");
    }
    Ok(())
}
