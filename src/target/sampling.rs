//! Decoding a per-position distribution into a token id.
//!
//! Rows are filtered in logit space (filtered entries become `-inf`) so that
//! a single softmax renormalizes whatever survives.

use std::cmp::Ordering;
use std::fmt;

use rand::Rng;
use serde::Serialize;

use crate::error::ConfigError;

/// How a relaxed position is turned into a discrete token.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(tag = "name", content = "param", rename_all = "snake_case")]
pub enum SamplingStrategy {
    #[default]
    Greedy,
    /// Renormalize over the `k` most likely tokens, then sample.
    TopK(usize),
    /// Renormalize over the smallest prefix whose mass reaches `p`, then sample.
    TopP(f64),
}

impl SamplingStrategy {
    /// Build a strategy from its configured name and parameter.
    ///
    /// # Errors
    /// Returns an error for an unknown name or an out-of-range parameter.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_name(name: &str, param: f64) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "greedy" | "argmax" => Ok(Self::Greedy),
            "topk" | "top_k" => {
                if !param.is_finite() || param < 1.0 {
                    return Err(ConfigError::Invalid {
                        option: "sampling_strategy_k",
                        reason: format!("top-k needs k >= 1, got {param}"),
                    });
                }
                Ok(Self::TopK(param as usize))
            }
            "topp" | "top_p" => {
                if !(param > 0.0 && param <= 1.0) {
                    return Err(ConfigError::Invalid {
                        option: "sampling_strategy_k",
                        reason: format!("top-p needs 0 < p <= 1, got {param}"),
                    });
                }
                Ok(Self::TopP(param))
            }
            other => Err(ConfigError::UnknownSampling(other.to_string())),
        }
    }
}

impl fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Greedy => f.write_str("greedy"),
            Self::TopK(k) => write!(f, "topk({k})"),
            Self::TopP(p) => write!(f, "topp({p})"),
        }
    }
}

/// Decode one probability row with `strategy`.
pub fn sample_row(probs: &[f32], strategy: SamplingStrategy, rng: &mut impl Rng) -> u32 {
    if let SamplingStrategy::Greedy = strategy {
        return argmax(probs);
    }
    let mut logits: Vec<f32> = probs.iter().map(|p| p.max(0.0).ln()).collect();
    match strategy {
        SamplingStrategy::TopK(k) => filter_top_k(&mut logits, k),
        SamplingStrategy::TopP(p) => filter_top_p(&mut logits, p),
        SamplingStrategy::Greedy => {}
    }
    let renormalized = softmax(&logits);
    if renormalized.iter().all(|p| *p == 0.0) {
        return argmax(probs);
    }
    sample_multinomial(&renormalized, rng)
}

/// Index of the largest finite value; 0 when nothing is finite.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn argmax(row: &[f32]) -> u32 {
    row.iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map_or(0, |(i, _)| i as u32)
}

fn ranked(logits: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| {
        let (x, y) = (logits[a], logits[b]);
        match (x.is_nan(), y.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        }
    });
    order
}

/// Keep exactly the `k` highest entries (ties broken by position).
///
/// `k` is clamped to `[1, len]`.
pub fn filter_top_k(logits: &mut [f32], k: usize) {
    if logits.is_empty() {
        return;
    }
    let k = k.clamp(1, logits.len());
    for &idx in ranked(logits).iter().skip(k) {
        logits[idx] = f32::NEG_INFINITY;
    }
}

/// Keep the smallest high-probability prefix whose cumulative mass is at least `p`.
///
/// The most likely entry always survives.
pub fn filter_top_p(logits: &mut [f32], p: f64) {
    if logits.is_empty() || p >= 1.0 {
        return;
    }
    let probs = softmax(logits);
    let order = ranked(logits);
    let mut keep = vec![false; logits.len()];
    let mut mass = 0.0_f64;
    for &idx in &order {
        keep[idx] = true;
        mass += f64::from(probs[idx]);
        if mass >= p {
            break;
        }
    }
    for (v, kept) in logits.iter_mut().zip(keep) {
        if !kept {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Softmax over the finite entries; all zeros if none is finite.
#[must_use]
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f32> = logits
        .iter()
        .map(|&v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let total: f32 = exps.iter().sum();
    if total == 0.0 {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|e| e / total).collect()
}

/// Draw an index from a normalized distribution.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn sample_multinomial(probs: &[f32], rng: &mut impl Rng) -> u32 {
    let r: f32 = rng.r#gen();
    let mut cumulative = 0.0_f32;
    for (idx, &p) in probs.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return idx as u32;
        }
    }
    // Rounding left r above the total mass.
    probs.iter().rposition(|p| *p > 0.0).unwrap_or(0) as u32
}
