//! Per-step events and the observers that consume them.

use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Snapshot of one optimization step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepEvent {
    pub example: usize,
    pub length: usize,
    pub step: usize,
    /// Value of the primal objective that was backpropagated.
    pub objective: f64,
    /// Per-objective losses, primary first.
    pub losses: Vec<f64>,
    pub weighted_loss: f64,
    /// Current threshold per constraint.
    pub thresholds: Vec<f64>,
    pub satisfied: Vec<bool>,
    /// Multipliers after this step's dual update; empty without constraints.
    pub multipliers: Vec<f64>,
    pub best_loss: Option<f64>,
    pub best_step: Option<usize>,
}

impl StepEvent {
    #[must_use]
    pub fn all_satisfied(&self) -> bool {
        self.satisfied.iter().all(|&s| s)
    }
}

pub trait StepObserver {
    fn on_step(&self, event: &StepEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl StepObserver for NullObserver {
    fn on_step(&self, _event: &StepEvent) {}
}

/// Progress line every `interval` steps at `info`, every other step at `debug`.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    abbrs: Vec<String>,
    interval: usize,
}

impl TracingObserver {
    #[must_use]
    pub fn new(abbrs: Vec<String>, interval: usize) -> Self {
        Self {
            abbrs,
            interval: interval.max(1),
        }
    }

    fn format_losses(&self, losses: &[f64]) -> String {
        losses
            .iter()
            .enumerate()
            .map(|(i, loss)| {
                let abbr = self.abbrs.get(i).map_or("loss", String::as_str);
                format!("{abbr}:{loss:.4}")
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl StepObserver for TracingObserver {
    fn on_step(&self, event: &StepEvent) {
        let cons = event
            .satisfied
            .iter()
            .map(|&s| if s { "sat" } else { "vio" })
            .collect::<Vec<_>>()
            .join(",");
        let losses = self.format_losses(&event.losses);
        if event.step % self.interval == 0 {
            tracing::info!(
                example = event.example,
                length = event.length,
                step = event.step,
                objective = format_args!("{:.4}", event.objective),
                loss = format_args!("{:.4}", event.weighted_loss),
                %losses,
                lambdas = ?event.multipliers,
                eps = ?event.thresholds,
                %cons,
                best = ?event.best_loss,
                best_step = ?event.best_step,
                "step"
            );
        } else {
            tracing::debug!(
                example = event.example,
                length = event.length,
                step = event.step,
                loss = event.weighted_loss,
                %losses,
                %cons,
                "step"
            );
        }
    }
}

/// Keeps every event; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<StepEvent>>>,
}

impl RecordingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<StepEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl StepObserver for RecordingObserver {
    fn on_step(&self, event: &StepEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(step: usize) -> StepEvent {
        StepEvent {
            example: 0,
            length: 3,
            step,
            objective: 1.0,
            losses: vec![1.0, 0.5],
            weighted_loss: 1.0,
            thresholds: vec![0.4],
            satisfied: vec![false],
            multipliers: vec![0.1],
            best_loss: Some(1.0),
            best_step: Some(0),
        }
    }

    #[test]
    fn test_recording_observer_shares_buffer() {
        let recorder = RecordingObserver::new();
        let handle = recorder.clone();
        handle.on_step(&event(0));
        handle.on_step(&event(1));
        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].step, 1);
        assert!(!events[0].all_satisfied());
    }

    #[test]
    fn test_format_losses_uses_abbreviations() {
        let observer = TracingObserver::new(vec!["flu".into()], 0);
        assert_eq!(observer.format_losses(&[1.0, 2.5]), "flu:1.0000 loss:2.5000");
        observer.on_step(&event(0));
    }
}
