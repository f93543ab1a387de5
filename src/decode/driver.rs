//! Per-example control flow: baseline, length sweep, selection, output.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

use candle_core::Device;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

use super::cancel::CancelFlag;
use super::dual::{DualOptimization, LoopSettings, ObjectiveSlot};
use super::observer::{StepObserver, TracingObserver};
use super::record::Candidate;
use super::selection::{candidate_for_length, length_window, should_replace};
use crate::config::{DecodePlan, InitPolicy};
use crate::data::{Dataset, Example};
use crate::error::{ConfigError, Result};
use crate::schedule::EpsilonSchedule;
use crate::scoring::{
    BaselineGenerator, LossContext, TextTokenizer, check_vocabularies, clean_output,
};
use crate::target::{RelaxedTarget, TargetInit};

/// Final decision for one example.
#[derive(Debug, Clone, PartialEq)]
pub struct ExampleOutcome {
    pub index: usize,
    pub candidate: Candidate,
    pub baseline: Candidate,
    /// The baseline already satisfied every constraint, so nothing was optimized.
    pub skipped_optimization: bool,
    pub lengths_tried: Vec<usize>,
    pub steps_run: usize,
    /// Step of the best record per tried length.
    pub best_steps: Vec<usize>,
    pub satisfying_texts: BTreeSet<String>,
}

impl ExampleOutcome {
    /// The output line: trimmed, embedded newlines replaced by spaces.
    #[must_use]
    pub fn output_line(&self) -> String {
        self.candidate.text.trim().replace('\n', " ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub examples: usize,
    pub skipped_by_baseline: usize,
    pub debug_skipped: usize,
    /// Mean step at which each length's best record was found.
    pub mean_best_step: Option<f64>,
}

pub struct Decoder {
    plan: DecodePlan,
    settings: LoopSettings,
    slots: Vec<ObjectiveSlot>,
    generator: Arc<dyn BaselineGenerator>,
    tokenizer: Arc<dyn TextTokenizer>,
    observer: Box<dyn StepObserver>,
    cancel: CancelFlag,
    vocab: usize,
    /// Most output tokens every scoring model can take after one context token.
    capacity: Option<usize>,
    device: Device,
    rng: StdRng,
}

impl Decoder {
    /// Bind a validated plan to its objectives and collaborators.
    ///
    /// # Errors
    /// Returns an error if the objectives do not match the plan, or if the
    /// scoring models disagree on vocabulary without the override.
    pub fn new(
        plan: DecodePlan,
        slots: Vec<ObjectiveSlot>,
        generator: Arc<dyn BaselineGenerator>,
        tokenizer: Arc<dyn TextTokenizer>,
    ) -> Result<Self> {
        if slots.len() != plan.objectives.len() {
            return Err(ConfigError::CountMismatch {
                option: "objectives",
                expected: plan.objectives.len(),
                found: slots.len(),
            }
            .into());
        }
        let sizes: Vec<(&str, usize)> = slots
            .iter()
            .map(|slot| {
                let model = slot.objective.model();
                (model.name(), model.vocab_size())
            })
            .collect();
        let vocab = check_vocabularies(&sizes, plan.allow_diff_vocab)?;
        let capacity = slots
            .iter()
            .filter_map(|slot| slot.objective.model().max_sequence_length())
            .map(|max| max.saturating_sub(1))
            .min();
        let device = slots[0].objective.model().embedding_table().device().clone();

        let rng = plan
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let abbrs = slots.iter().map(|slot| slot.abbr.clone()).collect();
        let observer = Box::new(TracingObserver::new(abbrs, plan.log_interval));

        Ok(Self {
            settings: LoopSettings::from(&plan),
            plan,
            slots,
            generator,
            tokenizer,
            observer,
            cancel: CancelFlag::new(),
            vocab,
            capacity,
            device,
            rng,
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Box<dyn StepObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn plan(&self) -> &DecodePlan {
        &self.plan
    }

    /// Baseline, optional optimization sweep and final selection for one example.
    ///
    /// # Errors
    /// Returns an error if generation, scoring or a tensor operation fails.
    #[allow(clippy::too_many_lines)]
    pub fn decode_example(&mut self, example: &Example) -> Result<ExampleOutcome> {
        let eos = self.tokenizer.eos_id();
        let source = self.tokenizer.encode(&example.source);
        let additional = self.tokenizer.encode(&example.additional);

        let baseline_max_length = self
            .capacity
            .map_or(self.plan.baseline_max_length, |capacity| {
                capacity.min(self.plan.baseline_max_length)
            });
        let generated =
            self.generator
                .generate(&additional, baseline_max_length, self.plan.beam_size)?;
        let baseline_tokens = clean_output(&generated, eos).to_vec();
        let baseline_text = self.tokenizer.decode(&baseline_tokens);

        let ctx = LossContext {
            source,
            target_prefix: Vec::new(),
            additional,
        };
        let mut baseline_losses = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let (loss, output) =
                slot.objective
                    .compute_gold_loss(&ctx, &baseline_tokens, slot.label_id)?;
            tracing::debug!(
                example = example.index,
                objective = %slot.abbr,
                label = slot.label_id,
                loss,
                predicted_label = ?output.predicted_label,
                "baseline loss"
            );
            baseline_losses.push(loss);
        }
        let baseline_loss: f64 = self
            .plan
            .betas
            .iter()
            .zip(&baseline_losses)
            .map(|(beta, loss)| beta * loss)
            .sum();
        let baseline_allsat = baseline_losses[1..]
            .iter()
            .zip(&self.plan.schedules)
            .all(|(loss, schedule)| *loss <= schedule.floor);
        let schedules: Vec<EpsilonSchedule> = if self.plan.gold_loss_epsilons {
            self.plan
                .schedules
                .iter()
                .zip(&baseline_losses[1..])
                .map(|(schedule, loss)| schedule.with_floor(*loss))
                .collect()
        } else {
            self.plan.schedules.clone()
        };

        tracing::info!(
            example = example.index,
            baseline = %baseline_text,
            loss = baseline_loss,
            allsat = baseline_allsat,
            "baseline"
        );
        let baseline = Candidate::baseline(baseline_text, baseline_loss, baseline_allsat);
        let mut outcome = ExampleOutcome {
            index: example.index,
            candidate: baseline.clone(),
            baseline: baseline.clone(),
            skipped_optimization: false,
            lengths_tried: Vec::new(),
            steps_run: 0,
            best_steps: Vec::new(),
            satisfying_texts: BTreeSet::new(),
        };

        if baseline_allsat && !self.plan.always_optimize {
            tracing::info!(
                example = example.index,
                "baseline satisfies every constraint; skipping optimization"
            );
            outcome.skipped_optimization = true;
            return Ok(outcome);
        }

        let reference = self.reference_ids(example);
        let lengths = match (&reference, self.plan.max_length) {
            (Some(ids), _) => vec![ids.len()],
            (None, Some(max_length)) => vec![max_length],
            (None, None) => length_window(
                baseline_tokens.len(),
                self.plan.length_diff,
                self.plan.max_allowed_length,
            ),
        };
        if lengths.is_empty() {
            tracing::warn!(
                example = example.index,
                predicted = baseline_tokens.len(),
                "no candidate length within max_allowed_length; keeping the baseline"
            );
        }

        for requested in lengths {
            let (length, prefix) = if self.plan.prefix_length > 0 && reference.is_none() {
                let prefix: Vec<u32> = baseline_tokens
                    .iter()
                    .take(self.plan.prefix_length)
                    .copied()
                    .collect();
                (requested.checked_sub(self.plan.prefix_length), prefix)
            } else {
                (Some(requested), Vec::new())
            };
            let Some(mut length) = length.filter(|&l| l > 0) else {
                tracing::debug!(
                    example = example.index,
                    requested,
                    prefix_length = self.plan.prefix_length,
                    "no tokens left to optimize; skipping length"
                );
                continue;
            };
            if length > self.plan.max_allowed_length {
                tracing::info!(
                    example = example.index,
                    from = length,
                    to = self.plan.max_allowed_length,
                    "clamping output length"
                );
                length = self.plan.max_allowed_length;
            }
            if let Some(capacity) = self.capacity.filter(|&capacity| length > capacity) {
                if capacity == 0 {
                    tracing::warn!(
                        example = example.index,
                        "scoring models leave no room for output tokens; skipping length"
                    );
                    continue;
                }
                tracing::info!(
                    example = example.index,
                    from = length,
                    to = capacity,
                    "clamping output length to the scoring models' context"
                );
                length = capacity;
            }
            if outcome.lengths_tried.contains(&length) {
                tracing::debug!(example = example.index, length, "length already tried");
                continue;
            }

            let init = match (&reference, self.plan.init) {
                (Some(ids), _) => TargetInit::Reference(vec![ids[..length].to_vec()]),
                (None, InitPolicy::Random) => TargetInit::Random,
                (None, _) => TargetInit::Zeros,
            };
            let target = RelaxedTarget::new(
                1,
                length,
                self.vocab,
                &self.plan.target,
                &init,
                &self.device,
                &mut self.rng,
            )?;
            let length_ctx = LossContext {
                target_prefix: prefix,
                ..ctx.clone()
            };
            let run = DualOptimization {
                slots: &self.slots,
                schedules: &schedules,
                settings: &self.settings,
                ctx: &length_ctx,
                tokenizer: self.tokenizer.as_ref(),
                observer: self.observer.as_ref(),
                cancel: &self.cancel,
                example: example.index,
            };
            let result = run.run(&target, &mut self.rng)?;
            drop(target);

            outcome.lengths_tried.push(length);
            outcome.steps_run += result.steps_run;
            outcome.satisfying_texts.extend(result.satisfying_texts);
            if let Some(best) = &result.best {
                outcome.best_steps.push(best.step);
                tracing::info!(
                    example = example.index,
                    length,
                    step = best.step,
                    loss = best.loss,
                    allsat = best.all_satisfied(),
                    text = %best.text,
                    "best for length"
                );
            }

            let candidate =
                candidate_for_length(self.plan.criterion, result.best.as_ref(), &baseline);
            if should_replace(self.plan.criterion, Some(&outcome.candidate), &candidate) {
                outcome.candidate = candidate;
            }
        }

        if outcome.candidate.is_baseline() {
            tracing::info!(
                example = example.index,
                "no optimized candidate beat the baseline"
            );
        }
        if self.plan.show_all_outputs {
            for text in &outcome.satisfying_texts {
                tracing::info!(example = example.index, %text, "satisfying output");
            }
        }
        Ok(outcome)
    }

    /// Decode every example in order, writing one line each to `out`.
    ///
    /// # Errors
    /// Returns the first decoding or write error.
    pub fn run(&mut self, dataset: &Dataset, out: &mut dyn Write) -> Result<RunSummary> {
        let limit = self.plan.num_examples.unwrap_or(usize::MAX);
        let mut summary = RunSummary::default();
        let mut best_steps = Vec::new();

        for example in dataset.examples() {
            if summary.examples >= limit {
                break;
            }
            if self.plan.debug_skip.contains(&example.index) {
                tracing::info!(example = example.index, "skipping example");
                summary.debug_skipped += 1;
                continue;
            }
            let outcome = self.decode_example(example)?;
            writeln!(out, "{}", outcome.output_line())?;
            out.flush()?;

            summary.examples += 1;
            if outcome.skipped_optimization {
                summary.skipped_by_baseline += 1;
            }
            best_steps.extend(outcome.best_steps);
        }

        summary.mean_best_step = mean(&best_steps);
        tracing::info!(
            examples = summary.examples,
            skipped_by_baseline = summary.skipped_by_baseline,
            mean_best_step = ?summary.mean_best_step,
            "decoding finished"
        );
        Ok(summary)
    }

    /// Ids the target starts from under `source`/`target` initialization.
    fn reference_ids(&self, example: &Example) -> Option<Vec<u32>> {
        let ids = match self.plan.init {
            InitPolicy::Source => self.tokenizer.encode_plain(&example.source),
            InitPolicy::Target => {
                if self.slots[0].objective.model().uses_separate_target_tokenizer() {
                    self.tokenizer.encode_target(&example.target)
                } else {
                    self.tokenizer.encode_plain(&example.target)
                }
            }
            InitPolicy::Zeros | InitPolicy::Random => return None,
        };
        Some(ids)
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[usize]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<usize>() as f64 / values.len() as f64)
    }
}
