//! Choosing between candidates across lengths and against the baseline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::record::{BestRecord, Candidate};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionCriterion {
    /// Satisfying candidates win; the primary loss breaks ties among them.
    #[default]
    PrimaryAllsat,
    /// Lowest weighted loss wins, satisfaction ignored.
    WeightedSum,
}

impl FromStr for SelectionCriterion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary_allsat" => Ok(Self::PrimaryAllsat),
            "weighted_sum" => Ok(Self::WeightedSum),
            other => Err(ConfigError::UnknownSelection(other.to_string())),
        }
    }
}

impl fmt::Display for SelectionCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PrimaryAllsat => "primary_allsat",
            Self::WeightedSum => "weighted_sum",
        })
    }
}

/// Whether `new` should replace `current` as the lengthwise best.
#[must_use]
pub fn should_replace(
    criterion: SelectionCriterion,
    current: Option<&Candidate>,
    new: &Candidate,
) -> bool {
    if !new.loss.is_finite() {
        return false;
    }
    let Some(current) = current else {
        return true;
    };
    match criterion {
        SelectionCriterion::WeightedSum => new.loss < current.loss,
        SelectionCriterion::PrimaryAllsat => match (current.all_satisfied, new.all_satisfied) {
            (false, true) => true,
            (true, false) => false,
            _ => new.loss < current.loss,
        },
    }
}

/// Fold `candidates` in order with [`should_replace`].
#[must_use]
pub fn select_best(
    criterion: SelectionCriterion,
    candidates: impl IntoIterator<Item = Candidate>,
) -> Option<Candidate> {
    candidates.into_iter().fold(None, |best, candidate| {
        if should_replace(criterion, best.as_ref(), &candidate) {
            Some(candidate)
        } else {
            best
        }
    })
}

/// Lengths `[predicted − diff, predicted + diff] ∩ [1, max_allowed]`, ascending.
///
/// An empty prediction is centered on length 1.
#[must_use]
pub fn length_window(predicted: usize, diff: usize, max_allowed: usize) -> Vec<usize> {
    let center = predicted.max(1);
    let low = center.saturating_sub(diff).max(1);
    let high = center.saturating_add(diff).min(max_allowed);
    (low..=high).collect()
}

/// The candidate one length contributes to the lengthwise comparison.
///
/// Under [`SelectionCriterion::PrimaryAllsat`] an optimized result that does
/// not satisfy every constraint is replaced by the baseline, as is a length
/// that produced no finite step at all.
#[must_use]
pub fn candidate_for_length(
    criterion: SelectionCriterion,
    best: Option<&BestRecord>,
    baseline: &Candidate,
) -> Candidate {
    match best {
        Some(record) if criterion == SelectionCriterion::WeightedSum || record.all_satisfied() => {
            Candidate::from(record)
        }
        _ => baseline.clone(),
    }
}
