//! Quality level bookkeeping and adaptive bitrate selection.
//!
//! The controller is evaluated on the engine tick rather than per sample and
//! deliberately trades optimality for stability: at most one switch per
//! minimum interval, at most one level down per evaluation, and no upgrades
//! while the buffer is starved.

use std::cmp::Ordering;
use std::time::Instant;

use serde::Serialize;
use strum::Display;
use tracing::debug;

use crate::config::AbrConfig;
use crate::sink::SurfaceSize;

/// One selectable rendition of the current asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityLevel {
    /// Position in the bitrate-ascending level list
    pub index: usize,
    /// Bits per second
    pub bitrate: u64,
    pub width: u32,
    pub height: u32,
    pub codec: Option<String>,
    pub name: String,
}

impl QualityLevel {
    pub fn new(bitrate: u64, width: u32, height: u32) -> Self {
        Self {
            index: 0,
            bitrate,
            width,
            height,
            codec: None,
            name: Self::display_name(bitrate, height),
        }
    }

    pub fn with_codec(mut self, codec: Option<String>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    fn display_name(bitrate: u64, height: u32) -> String {
        if height > 0 {
            format!("{height}p")
        } else if bitrate > 0 {
            format!("{} kbps", bitrate / 1000)
        } else {
            "auto".to_string()
        }
    }
}

/// Sort levels by bitrate, then resolution, and assign their indices.
///
/// Each level travels with an adapter-specific payload so adapters can map the
/// final index back to their own variant.
pub fn rank_levels<T>(mut levels: Vec<(T, QualityLevel)>) -> Vec<(T, QualityLevel)> {
    levels.sort_by(|(_, a), (_, b)| {
        a.bitrate
            .cmp(&b.bitrate)
            .then_with(|| a.pixels().cmp(&b.pixels()))
    });
    for (index, (_, level)) in levels.iter_mut().enumerate() {
        level.index = index;
    }
    levels
}

/// Measurements fed into one evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbrInputs {
    /// Sustainable bitrate in bits per second, `None` before any measurement
    pub estimated_bitrate: Option<f64>,
    /// Buffer health in `0..=1`
    pub buffer_health: f64,
    pub surface: Option<SurfaceSize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum QualityReason {
    NoLevels,
    Manual,
    MinInterval,
    NoEstimate,
    UpSwitch,
    DownSwitch,
    BufferTooLowForUpSwitch,
    AlreadyOptimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityDecision {
    pub index: Option<usize>,
    pub reason: QualityReason,
    pub changed: bool,
}

impl QualityDecision {
    fn hold(index: Option<usize>, reason: QualityReason) -> Self {
        Self {
            index,
            reason,
            changed: false,
        }
    }
}

pub struct QualityController {
    config: AbrConfig,
    levels: Vec<QualityLevel>,
    current: Option<usize>,
    auto: bool,
    last_switch: Option<Instant>,
}

impl QualityController {
    pub fn new(config: AbrConfig) -> Self {
        Self {
            auto: config.auto_quality,
            config,
            levels: Vec::new(),
            current: None,
            last_switch: None,
        }
    }

    /// Replace the level set for a new asset.
    pub fn set_levels(&mut self, levels: Vec<QualityLevel>) {
        self.levels = levels;
        self.current = None;
        self.last_switch = None;
    }

    pub fn levels(&self) -> &[QualityLevel] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> Option<&QualityLevel> {
        self.levels.get(index)
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current_level(&self) -> Option<&QualityLevel> {
        self.current.and_then(|index| self.levels.get(index))
    }

    /// Record the level the adapter is actually playing.
    pub fn set_current_level(&mut self, index: usize) -> bool {
        if index >= self.levels.len() {
            return false;
        }
        self.current = Some(index);
        true
    }

    /// Pin `index` and leave automatic mode.
    pub fn select_level(&mut self, index: usize) -> Option<&QualityLevel> {
        if index >= self.levels.len() {
            return None;
        }
        self.auto = false;
        self.current = Some(index);
        self.levels.get(index)
    }

    pub fn set_auto_mode(&mut self, enabled: bool) {
        self.auto = enabled;
    }

    pub fn is_auto(&self) -> bool {
        self.auto
    }

    /// Move one level down, or stay at the lowest, without leaving the
    /// current mode. Counts as a switch for the minimum interval.
    pub fn step_down(&mut self, now: Instant) -> Option<usize> {
        if self.levels.is_empty() {
            return None;
        }
        let target = self.current.map_or(0, |current| current.saturating_sub(1));
        self.current = Some(target);
        self.last_switch = Some(now);
        Some(target)
    }

    pub fn reset(&mut self) {
        self.levels.clear();
        self.current = None;
        self.last_switch = None;
        self.auto = self.config.auto_quality;
    }

    /// Decide which level should play next.
    pub fn optimal_level(&mut self, now: Instant, inputs: &AbrInputs) -> QualityDecision {
        if self.levels.is_empty() {
            return QualityDecision::hold(None, QualityReason::NoLevels);
        }
        if !self.auto {
            return QualityDecision::hold(self.current, QualityReason::Manual);
        }
        if let Some(last) = self.last_switch {
            if now.saturating_duration_since(last) < self.config.min_switch_interval {
                return QualityDecision::hold(self.current, QualityReason::MinInterval);
            }
        }
        let Some(estimated) = inputs.estimated_bitrate else {
            return QualityDecision::hold(self.current, QualityReason::NoEstimate);
        };

        let target = estimated * inputs.buffer_health.clamp(0.0, 1.0);
        let candidates = self.candidates(inputs.surface);
        let mut chosen = self.pick(&candidates, target);
        let current = self.current.unwrap_or(0);

        let mut reason = match chosen.cmp(&current) {
            Ordering::Greater => QualityReason::UpSwitch,
            Ordering::Less => QualityReason::DownSwitch,
            Ordering::Equal => QualityReason::AlreadyOptimal,
        };
        if chosen < current {
            chosen = chosen.max(current - 1);
        } else if chosen > current && inputs.buffer_health < self.config.starved_threshold {
            chosen = current;
            reason = QualityReason::BufferTooLowForUpSwitch;
        }

        let changed = Some(chosen) != self.current;
        if changed {
            debug!(
                from = ?self.current,
                to = chosen,
                target_bps = target as u64,
                health = inputs.buffer_health,
                %reason,
                "ABR switch"
            );
            self.current = Some(chosen);
            self.last_switch = Some(now);
        }
        QualityDecision {
            index: Some(chosen),
            reason,
            changed,
        }
    }

    /// Indices of levels that fit the surface, never empty.
    fn candidates(&self, surface: Option<SurfaceSize>) -> Vec<usize> {
        let surface = match surface {
            Some(surface) if self.config.cap_level_to_surface && surface.width > 0 => surface,
            _ => return (0..self.levels.len()).collect(),
        };
        let scale = surface.pixel_ratio.max(1.0) * self.config.surface_headroom;
        let max_width = f64::from(surface.width) * scale;
        let max_height = f64::from(surface.height) * scale;

        let fitting: Vec<usize> = self
            .levels
            .iter()
            .filter(|level| {
                (level.width == 0 || f64::from(level.width) <= max_width)
                    && (level.height == 0 || f64::from(level.height) <= max_height)
            })
            .map(|level| level.index)
            .collect();
        if fitting.is_empty() { vec![0] } else { fitting }
    }

    /// Highest bitrate at or below `target`. Equal bitrates resolve to the
    /// lower resolution.
    fn pick(&self, candidates: &[usize], target: f64) -> usize {
        let best_bitrate = candidates
            .iter()
            .map(|&i| self.levels[i].bitrate)
            .filter(|&bitrate| bitrate as f64 <= target)
            .max();
        match best_bitrate {
            Some(bitrate) => candidates
                .iter()
                .copied()
                .find(|&i| self.levels[i].bitrate == bitrate)
                .unwrap_or(candidates[0]),
            None => candidates[0],
        }
    }
}
