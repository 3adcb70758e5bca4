//! Error classification and recovery planning.
//!
//! The planner keeps a per-code occurrence history with a decaying window and
//! a global attempt budget for the current load session. Each error is mapped
//! to one rung of its class ladder.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use strum::Display;
use tracing::debug;

use crate::error::EngineError;

/// Broad family an error code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    Network,
    Fragment,
    Manifest,
    Buffer,
    Media,
    Unclassified,
}

impl ErrorClass {
    /// Classify an error code by substring, first match wins.
    pub fn classify(code: &str) -> Self {
        let code = code.to_ascii_uppercase();
        let has = |needle: &str| code.contains(needle);

        if has("NETWORK") || has("TIMEOUT") {
            Self::Network
        } else if has("FRAG") || has("SEGMENT") {
            Self::Fragment
        } else if has("MANIFEST") || has("LEVEL") {
            Self::Manifest
        } else if has("BUFFER") || has("STALL") {
            Self::Buffer
        } else if has("DECODE") || has("MEDIA") {
            Self::Media
        } else {
            Self::Unclassified
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "camelCase")]
pub enum RecoveryKind {
    Retry,
    SeekPast,
    Reload,
    DowngradeQuality,
    Fatal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryAction {
    pub kind: RecoveryKind,
    pub delay: Duration,
    pub reason: String,
}

impl RecoveryAction {
    fn new(kind: RecoveryKind, delay: Duration, reason: impl Into<String>) -> Self {
        Self {
            kind,
            delay,
            reason: reason.into(),
        }
    }

    /// Give up: nothing will be attempted for this error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::new(RecoveryKind::Fatal, Duration::ZERO, reason)
    }
}

/// Ceilings and delays for every recovery ladder.
///
/// A rung with count `n` in the window is chosen by comparing `n` against the
/// class ceilings. The delay for a rung is `base * backoff_factor^(n - 1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Occurrences of one code older than this are forgotten.
    pub error_window: Duration,
    /// Attempts across all codes per load session before everything is fatal.
    pub max_total_attempts: u32,
    /// Growth factor applied per occurrence within the window.
    pub backoff_factor: f64,
    /// Upper bound for any computed delay.
    pub max_delay: Duration,

    /// Network/timeout retries before reloading.
    pub network_retries: u32,
    pub retry_delay: Duration,
    pub reload_delay: Duration,

    /// Fragment retries before seeking past the fragment.
    pub fragment_retries: u32,
    /// Fragment occurrences handled by seeking before downgrading.
    pub fragment_seek_ceiling: u32,
    pub fragment_retry_delay: Duration,
    pub seek_delay: Duration,
    pub downgrade_delay: Duration,

    /// Manifest/level retries before downgrading.
    pub manifest_retries: u32,

    /// Buffer stalls handled by seeking before reloading.
    pub stall_seeks: u32,
    pub stall_reload_delay: Duration,

    /// Decode/media errors handled by seeking.
    pub media_seeks: u32,
    /// Decode/media occurrences handled by downgrading before reloading.
    pub media_downgrade_ceiling: u32,
    pub media_seek_delay: Duration,
    pub media_downgrade_delay: Duration,

    /// Retries for unclassified errors before giving up.
    pub generic_retries: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            error_window: Duration::from_secs(30),
            max_total_attempts: 12,
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(10),

            network_retries: 6,
            retry_delay: Duration::from_millis(500),
            reload_delay: Duration::from_secs(1),

            fragment_retries: 2,
            fragment_seek_ceiling: 5,
            fragment_retry_delay: Duration::from_millis(300),
            seek_delay: Duration::from_millis(100),
            downgrade_delay: Duration::from_millis(500),

            manifest_retries: 4,

            stall_seeks: 2,
            stall_reload_delay: Duration::from_millis(500),

            media_seeks: 2,
            media_downgrade_ceiling: 4,
            media_seek_delay: Duration::from_millis(200),
            media_downgrade_delay: Duration::from_millis(300),

            generic_retries: 3,
        }
    }
}

impl RecoveryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.backoff_factor < 1.0 || !self.backoff_factor.is_finite() {
            return Err(format!(
                "backoff_factor must be a finite value >= 1, got {}",
                self.backoff_factor
            ));
        }
        if self.fragment_seek_ceiling < self.fragment_retries {
            return Err("fragment_seek_ceiling must be >= fragment_retries".to_string());
        }
        if self.media_downgrade_ceiling < self.media_seeks {
            return Err("media_downgrade_ceiling must be >= media_seeks".to_string());
        }
        if self.error_window.is_zero() {
            return Err("error_window must be non-zero".to_string());
        }
        Ok(())
    }

    fn scaled(&self, base: Duration, count: u32) -> Duration {
        if count <= 1 {
            return base.min(self.max_delay);
        }
        let exponent = count.saturating_sub(1).min(64) as i32;
        let secs = base.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The rung of `class`'s ladder for the `count`-th occurrence in the window.
    fn rung(&self, class: ErrorClass, count: u32) -> RecoveryAction {
        use RecoveryKind::*;

        match class {
            ErrorClass::Network => {
                if count <= self.network_retries {
                    RecoveryAction::new(
                        Retry,
                        self.scaled(self.retry_delay, count),
                        format!("network retry {count}/{}", self.network_retries),
                    )
                } else {
                    RecoveryAction::new(
                        Reload,
                        self.scaled(self.reload_delay, count - self.network_retries),
                        "network errors persist, reloading",
                    )
                }
            }
            ErrorClass::Fragment => {
                if count <= self.fragment_retries {
                    RecoveryAction::new(
                        Retry,
                        self.scaled(self.fragment_retry_delay, count),
                        format!("fragment retry {count}/{}", self.fragment_retries),
                    )
                } else if count <= self.fragment_seek_ceiling {
                    RecoveryAction::new(
                        SeekPast,
                        self.scaled(self.seek_delay, count - self.fragment_retries),
                        "seeking past bad fragment",
                    )
                } else {
                    RecoveryAction::new(
                        DowngradeQuality,
                        self.scaled(self.downgrade_delay, count - self.fragment_seek_ceiling),
                        "fragment errors persist, downgrading quality",
                    )
                }
            }
            ErrorClass::Manifest => {
                if count <= self.manifest_retries {
                    RecoveryAction::new(
                        Retry,
                        self.scaled(self.retry_delay, count),
                        format!("manifest retry {count}/{}", self.manifest_retries),
                    )
                } else {
                    RecoveryAction::new(
                        DowngradeQuality,
                        self.scaled(self.downgrade_delay, count - self.manifest_retries),
                        "level errors persist, downgrading quality",
                    )
                }
            }
            ErrorClass::Buffer => {
                if count <= self.stall_seeks {
                    RecoveryAction::new(
                        SeekPast,
                        self.scaled(self.seek_delay, count),
                        "seeking to recover buffer",
                    )
                } else {
                    RecoveryAction::new(
                        Reload,
                        self.scaled(self.stall_reload_delay, count - self.stall_seeks),
                        "buffer errors persist, reloading",
                    )
                }
            }
            ErrorClass::Media => {
                if count <= self.media_seeks {
                    RecoveryAction::new(
                        SeekPast,
                        self.scaled(self.media_seek_delay, count),
                        "seeking past decode error",
                    )
                } else if count <= self.media_downgrade_ceiling {
                    RecoveryAction::new(
                        DowngradeQuality,
                        self.scaled(self.media_downgrade_delay, count - self.media_seeks),
                        "decode errors persist, downgrading quality",
                    )
                } else {
                    RecoveryAction::new(
                        Reload,
                        self.scaled(self.reload_delay, count - self.media_downgrade_ceiling),
                        "decode errors persist, reloading",
                    )
                }
            }
            ErrorClass::Unclassified => {
                if count <= self.generic_retries {
                    RecoveryAction::new(
                        Retry,
                        self.scaled(self.retry_delay, count),
                        format!("generic retry {count}/{}", self.generic_retries),
                    )
                } else {
                    RecoveryAction::fatal("unrecoverable error")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Occurrence {
    count: u32,
    last_seen: Instant,
}

/// Maps raised errors to recovery actions.
#[derive(Debug)]
pub struct RecoveryPlanner {
    policy: RecoveryPolicy,
    history: HashMap<String, Occurrence>,
    attempts: u32,
}

impl RecoveryPlanner {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            history: HashMap::new(),
            attempts: 0,
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Recovery attempts planned in the current session.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record `error` at `now` and decide how to respond to it.
    pub fn analyze(&mut self, error: &EngineError, now: Instant) -> RecoveryAction {
        let window = self.policy.error_window;
        let entry = self
            .history
            .entry(error.code.clone())
            .or_insert(Occurrence {
                count: 0,
                last_seen: now,
            });
        if now.saturating_duration_since(entry.last_seen) > window {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last_seen = now;
        let count = entry.count;

        self.attempts += 1;
        if self.attempts > self.policy.max_total_attempts {
            return RecoveryAction::fatal(format!(
                "max recovery attempts exceeded ({}/{})",
                self.attempts, self.policy.max_total_attempts
            ));
        }

        let class = ErrorClass::classify(&error.code);
        let action = self.policy.rung(class, count);
        debug!(
            code = %error.code,
            %class,
            count,
            attempts = self.attempts,
            action = %action.kind,
            "Classified error"
        );
        action
    }

    /// Forget all history. Called for every new asset.
    pub fn reset(&mut self) {
        self.history.clear();
        self.attempts = 0;
    }
}

impl Default for RecoveryPlanner {
    fn default() -> Self {
        Self::new(RecoveryPolicy::default())
    }
}
