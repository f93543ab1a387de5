//! Result records kept while decoding one example.

/// Best step seen for one (example, length) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct BestRecord {
    /// Optimized tokens, without the fixed prefix.
    pub tokens: Vec<u32>,
    /// Weighted loss `Σ β_i · loss_i`.
    pub loss: f64,
    pub losses: Vec<f64>,
    /// One flag per constraint.
    pub satisfied: Vec<bool>,
    pub step: usize,
    pub text: String,
}

impl BestRecord {
    #[must_use]
    pub fn all_satisfied(&self) -> bool {
        self.satisfied.iter().all(|&s| s)
    }
}

/// Strict running minimum over [`BestRecord`]s; never regresses.
#[derive(Debug, Clone, Default)]
pub struct RunningBest {
    record: Option<BestRecord>,
}

impl RunningBest {
    /// Keep `candidate` if its loss is finite and strictly lower than the
    /// current best. Ties keep the earlier record. Returns whether it was kept.
    pub fn offer(&mut self, candidate: BestRecord) -> bool {
        if !candidate.loss.is_finite() {
            return false;
        }
        let better = self
            .record
            .as_ref()
            .is_none_or(|best| candidate.loss < best.loss);
        if better {
            self.record = Some(candidate);
        }
        better
    }

    #[must_use]
    pub fn get(&self) -> Option<&BestRecord> {
        self.record.as_ref()
    }

    #[must_use]
    pub fn into_inner(self) -> Option<BestRecord> {
        self.record
    }
}

/// A finished candidate for one example: the lengthwise-best record.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub text: String,
    pub loss: f64,
    pub all_satisfied: bool,
    /// Step that produced it; `None` for the baseline.
    pub step: Option<usize>,
}

impl Candidate {
    #[must_use]
    pub fn baseline(text: String, loss: f64, all_satisfied: bool) -> Self {
        Self {
            text,
            loss,
            all_satisfied,
            step: None,
        }
    }

    #[must_use]
    pub fn is_baseline(&self) -> bool {
        self.step.is_none()
    }
}

impl From<&BestRecord> for Candidate {
    fn from(record: &BestRecord) -> Self {
        Self {
            text: record.text.clone(),
            loss: record.loss,
            all_satisfied: record.all_satisfied(),
            step: Some(record.step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(loss: f64, step: usize) -> BestRecord {
        BestRecord {
            tokens: vec![1, 2],
            loss,
            losses: vec![loss],
            satisfied: vec![true],
            step,
            text: format!("step {step}"),
        }
    }

    #[test]
    fn test_offer_keeps_strict_minimum() {
        let mut best = RunningBest::default();
        assert!(best.offer(record(3.0, 0)));
        assert!(!best.offer(record(4.0, 1)));
        assert!(best.offer(record(1.0, 2)));
        assert_eq!(best.get().unwrap().step, 2);
    }

    #[test]
    fn test_ties_keep_earlier_record() {
        let mut best = RunningBest::default();
        best.offer(record(2.0, 0));
        assert!(!best.offer(record(2.0, 5)));
        assert_eq!(best.into_inner().unwrap().step, 0);
    }

    #[test]
    fn test_non_finite_never_becomes_best() {
        let mut best = RunningBest::default();
        assert!(!best.offer(record(f64::NAN, 0)));
        assert!(best.get().is_none());
        best.offer(record(5.0, 1));
        assert!(!best.offer(record(f64::NEG_INFINITY, 2)));
        assert_eq!(best.get().unwrap().step, 1);
    }

    #[test]
    fn test_candidate_from_record() {
        let mut rec = record(1.5, 7);
        rec.satisfied = vec![true, false];
        let candidate = Candidate::from(&rec);
        assert!(!candidate.all_satisfied);
        assert_eq!(candidate.step, Some(7));
        assert!(Candidate::baseline("x".into(), 1.0, true).is_baseline());
    }
}
