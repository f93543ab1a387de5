//! Constraint threshold (epsilon) schedules.
//!
//! A constraint starts with a loose threshold that is usually satisfied by
//! default and is tightened towards its floor over the course of
//! optimization. Thresholds are a pure function of the step index.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Interpolation used between `start` and `floor` during cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayFn {
    /// Hold `start` until the cooldown ends.
    #[default]
    None,
    /// Straight line from `start` to `floor`.
    Linear,
    /// Drop to `floor` as soon as warmup ends.
    Step,
    /// Half-cosine from `start` to `floor`.
    Cosine,
}

impl FromStr for DecayFn {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "linear" => Ok(Self::Linear),
            "step" => Ok(Self::Step),
            "cosine" => Ok(Self::Cosine),
            other => Err(ConfigError::UnknownDecay(other.to_string())),
        }
    }
}

impl fmt::Display for DecayFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Linear => "linear",
            Self::Step => "step",
            Self::Cosine => "cosine",
        };
        f.write_str(name)
    }
}

/// Threshold schedule for a single constraint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpsilonSchedule {
    pub start: f64,
    pub floor: f64,
    pub warmup_steps: usize,
    pub cooldown_steps: usize,
    pub decay: DecayFn,
}

impl EpsilonSchedule {
    /// A schedule that never moves: `start == floor`.
    #[must_use]
    pub fn constant(value: f64) -> Self {
        Self {
            start: value,
            floor: value,
            warmup_steps: 1,
            cooldown_steps: 2,
            decay: DecayFn::None,
        }
    }

    /// Threshold at `step`.
    #[must_use]
    pub fn threshold(&self, step: usize) -> f64 {
        threshold(
            step,
            self.start,
            self.floor,
            self.warmup_steps,
            self.cooldown_steps,
            self.decay,
        )
    }

    /// Copy of this schedule whose floor is replaced, e.g. by the baseline's own loss.
    #[must_use]
    pub fn with_floor(&self, floor: f64) -> Self {
        Self { floor, ..*self }
    }
}

/// Threshold at `step` for the given schedule parameters.
///
/// Step 0 always yields `start`. Any step at or past `warmup + cooldown`
/// yields `floor`, whatever the decay function.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn threshold(
    step: usize,
    start: f64,
    floor: f64,
    warmup_steps: usize,
    cooldown_steps: usize,
    decay: DecayFn,
) -> f64 {
    if step == 0 || step < warmup_steps {
        return start;
    }
    let end = warmup_steps.saturating_add(cooldown_steps);
    if step >= end {
        return floor;
    }

    // Inside cooldown, so cooldown_steps > 0.
    let progress = (step - warmup_steps) as f64 / cooldown_steps as f64;
    match decay {
        DecayFn::None => start,
        DecayFn::Step => floor,
        DecayFn::Linear => start - (start - floor) * progress,
        DecayFn::Cosine => {
            floor + (start - floor) * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
        }
    }
}
