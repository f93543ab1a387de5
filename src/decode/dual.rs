//! Alternating descent on the relaxed target and ascent on the multipliers.
//!
//! One [`DualOptimization::run`] covers a single (example, length) pair. The
//! target, multipliers, optimizers and gradient stores it touches live only
//! for that call.

use std::collections::BTreeSet;
use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor};
use candle_nn::Optimizer;
use rand::Rng;
use serde::Serialize;

use super::cancel::CancelFlag;
use super::observer::{StepEvent, StepObserver};
use super::record::{BestRecord, RunningBest};
use crate::config::{DecodePlan, Precision};
use crate::lagrangian::LagrangeMultipliers;
use crate::optim::{GradientAscent, LossScaler, OptimizerKind, PrimalOptimizer, project_to_simplex};
use crate::schedule::EpsilonSchedule;
use crate::scoring::{LossContext, Objective, RelaxedInputs, TextTokenizer, clean_output, scalar};
use crate::target::{EmbeddingTable, RelaxedOutput, RelaxedTarget, TargetKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Stepping { step: usize },
    Done,
    Interrupted,
}

/// Loop options shared by every (example, length) pair of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopSettings {
    pub optim_steps: usize,
    pub optimizer: OptimizerKind,
    pub lr: f64,
    pub lambda_lr: f64,
    pub dampness: f64,
    pub betas: Vec<f64>,
    pub linear_scale: bool,
    pub precision: Precision,
    pub show_all_outputs: bool,
}

impl From<&DecodePlan> for LoopSettings {
    fn from(plan: &DecodePlan) -> Self {
        Self {
            optim_steps: plan.optim_steps,
            optimizer: plan.optimizer,
            lr: plan.lr,
            lambda_lr: plan.lambda_lr,
            dampness: plan.dampness,
            betas: plan.betas.clone(),
            linear_scale: plan.linear_scale,
            precision: plan.precision,
            show_all_outputs: plan.show_all_outputs,
        }
    }
}

/// A configured objective: the loss, its label and a short name for logs.
#[derive(Clone)]
pub struct ObjectiveSlot {
    pub abbr: String,
    pub objective: Arc<dyn Objective>,
    pub label_id: usize,
}

impl ObjectiveSlot {
    #[must_use]
    pub fn new(abbr: impl Into<String>, objective: Arc<dyn Objective>, label_id: usize) -> Self {
        Self {
            abbr: abbr.into(),
            objective,
            label_id,
        }
    }
}

/// Result of one (example, length) optimization.
#[derive(Debug, Clone)]
pub struct LengthOutcome {
    pub best: Option<BestRecord>,
    pub state: LoopState,
    pub steps_run: usize,
    /// Distinct texts that satisfied every constraint at some step.
    pub satisfying_texts: BTreeSet<String>,
}

pub struct DualOptimization<'a> {
    pub slots: &'a [ObjectiveSlot],
    /// One per constraint, i.e. `slots.len() - 1`.
    pub schedules: &'a [EpsilonSchedule],
    pub settings: &'a LoopSettings,
    pub ctx: &'a LossContext,
    pub tokenizer: &'a dyn TextTokenizer,
    pub observer: &'a dyn StepObserver,
    pub cancel: &'a CancelFlag,
    /// Example index, for events and logs.
    pub example: usize,
}

impl DualOptimization<'_> {
    /// Run the step budget on `target`, keeping the best step seen.
    ///
    /// # Errors
    /// Returns an error if the objective list is inconsistent, the optimizer
    /// cannot update the target's parameterization, or a tensor operation
    /// fails.
    #[allow(clippy::too_many_lines)]
    pub fn run(&self, target: &RelaxedTarget, rng: &mut impl Rng) -> Result<LengthOutcome> {
        let n = self.slots.len();
        if n == 0 {
            candle_core::bail!("dual optimization needs at least one objective");
        }
        if self.schedules.len() != n - 1 || self.settings.betas.len() != n {
            candle_core::bail!(
                "{n} objectives need {} schedules and {n} betas, got {} and {}",
                n - 1,
                self.schedules.len(),
                self.settings.betas.len()
            );
        }

        let logits = target.kind() == TargetKind::Simplex;
        if logits && self.settings.optimizer == OptimizerKind::ExpGd {
            candle_core::bail!(
                "optimizer {} renormalizes rows and cannot update {} logits",
                self.settings.optimizer,
                target.kind()
            );
        }

        let device = target.var().device().clone();
        let (_, length, _) = target.shape();
        let tables: Vec<EmbeddingTable> = self
            .slots
            .iter()
            .map(|slot| EmbeddingTable::from_model(slot.objective.model()))
            .collect();

        let multipliers = if n > 1 && !self.settings.linear_scale {
            Some(LagrangeMultipliers::new(n - 1, &device)?)
        } else {
            None
        };
        let mut primal =
            PrimalOptimizer::new(self.settings.optimizer, target.var().clone(), self.settings.lr)?;
        let mut dual = multipliers
            .as_ref()
            .map(|m| GradientAscent::new(vec![m.var().clone()], self.settings.lambda_lr))
            .transpose()?;
        let project = target.kind() == TargetKind::Probability && !primal.keeps_simplex();
        let mut scaler = (self.settings.precision == Precision::Half).then(LossScaler::default);

        let mut best = RunningBest::default();
        let mut satisfying_texts = BTreeSet::new();
        let mut state = LoopState::Init;
        let mut steps_run = 0;

        for step in 0..self.settings.optim_steps {
            if self.cancel.take() {
                tracing::info!(
                    example = self.example,
                    length,
                    step,
                    "interrupted; keeping the best candidate found so far"
                );
                state = LoopState::Interrupted;
                break;
            }
            state = LoopState::Stepping { step };

            let out = target.forward(&tables, rng)?;
            let losses = self.evaluate(&out, &tables)?;
            let thresholds: Vec<f64> = self.schedules.iter().map(|s| s.threshold(step)).collect();
            let (objective, dual_objective) =
                self.objectives(&losses, &thresholds, multipliers.as_ref())?;
            let objective_value = scalar(&objective)?;

            // Both gradients are taken before either update mutates its variable.
            let primal_grads = match scaler.as_mut() {
                Some(scaler) => scaled_backward(scaler, &objective, target)?,
                None => Some(objective.backward()?),
            };
            let dual_grads = dual_objective.as_ref().map(Tensor::backward).transpose()?;

            match &primal_grads {
                Some(grads) => {
                    primal.step(grads)?;
                    if project {
                        project_to_simplex(target.var())?;
                    }
                }
                None => tracing::debug!(step, "non-finite gradients; primal update skipped"),
            }
            if let (Some(dual), Some(grads), Some(m)) =
                (dual.as_mut(), dual_grads.as_ref(), multipliers.as_ref())
            {
                dual.step(grads)?;
                m.make_positive()?;
            }
            // Model parameter gradients go with the stores.
            drop(primal_grads);
            drop(dual_grads);

            let values = losses.iter().map(scalar).collect::<Result<Vec<f64>>>()?;
            let weighted: f64 = self
                .settings
                .betas
                .iter()
                .zip(&values)
                .map(|(beta, loss)| beta * loss)
                .sum();
            let satisfied: Vec<bool> = values[1..]
                .iter()
                .zip(&thresholds)
                .map(|(loss, eps)| loss <= eps)
                .collect();
            let all_satisfied = satisfied.iter().all(|&s| s);

            let tokens = out.tokens.first().cloned().unwrap_or_default();
            let text = self.decode_text(&tokens);
            if self.settings.show_all_outputs && n > 1 && all_satisfied {
                satisfying_texts.insert(text.clone());
            }
            best.offer(BestRecord {
                tokens,
                loss: weighted,
                losses: values.clone(),
                satisfied: satisfied.clone(),
                step,
                text,
            });
            steps_run += 1;

            let multiplier_values = multipliers
                .as_ref()
                .map(LagrangeMultipliers::values)
                .transpose()?
                .unwrap_or_default();
            self.observer.on_step(&StepEvent {
                example: self.example,
                length,
                step,
                objective: objective_value,
                losses: values,
                weighted_loss: weighted,
                thresholds,
                satisfied,
                multipliers: multiplier_values,
                best_loss: best.get().map(|b| b.loss),
                best_step: best.get().map(|b| b.step),
            });
        }

        if state != LoopState::Interrupted {
            state = LoopState::Done;
        }
        Ok(LengthOutcome {
            best: best.into_inner(),
            state,
            steps_run,
            satisfying_texts,
        })
    }

    /// Per-objective `(batch,)` f32 losses of the current target.
    fn evaluate(&self, out: &RelaxedOutput, tables: &[EmbeddingTable]) -> Result<Vec<Tensor>> {
        self.slots
            .iter()
            .zip(tables)
            .zip(&out.embeddings)
            .map(|((slot, table), embeddings)| {
                let inputs = RelaxedInputs {
                    tokens: &out.token_ids,
                    embeddings,
                    probs: &out.probs,
                    soft_probs: &out.soft_probs,
                };
                let (loss, _) =
                    slot.objective
                        .compute_loss(self.ctx, &inputs, slot.label_id, table.scale)?;
                loss.to_dtype(DType::F32)
            })
            .collect()
    }

    /// Scalar primal objective and, with multipliers, the scalar dual objective.
    fn objectives(
        &self,
        losses: &[Tensor],
        thresholds: &[f64],
        multipliers: Option<&LagrangeMultipliers>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        if self.settings.linear_scale {
            let mut total = losses[0].affine(self.settings.betas[0], 0.0)?;
            for (loss, beta) in losses.iter().zip(&self.settings.betas).skip(1) {
                total = total.add(&loss.affine(*beta, 0.0)?)?;
            }
            return Ok((total.sum_all()?, None));
        }
        let Some(multipliers) = multipliers else {
            return Ok((losses[0].sum_all()?, None));
        };

        let mut primal = losses[0].clone();
        let mut dual = losses[0].zeros_like()?;
        for (i, (loss, &eps)) in losses[1..].iter().zip(thresholds).enumerate() {
            let violation = loss.affine(-1.0, eps)?;
            let damp = violation.detach().affine(self.settings.dampness, 0.0)?;
            // min(violation, 0): satisfied constraints add no primal penalty.
            let clamped = violation.sub(&violation.relu()?)?;
            primal = primal.sub(&multipliers.get_loss(i, &damp, &clamped)?)?;
            dual = dual.sub(&multipliers.get_loss(i, &damp, &violation)?)?;
        }
        Ok((primal.sum_all()?, Some(dual.sum_all()?)))
    }

    fn decode_text(&self, tokens: &[u32]) -> String {
        let full: Vec<u32> = self
            .ctx
            .target_prefix
            .iter()
            .chain(tokens)
            .copied()
            .collect();
        self.tokenizer
            .decode(clean_output(&full, self.tokenizer.eos_id()))
    }
}

/// Backward through the loss scaler; `None` when the step must be skipped.
fn scaled_backward(
    scaler: &mut LossScaler,
    objective: &Tensor,
    target: &RelaxedTarget,
) -> Result<Option<GradStore>> {
    let mut grads = scaler.scale_loss(objective)?.backward()?;
    let finite = scaler.unscale(&mut grads, &[target.var()])?;
    scaler.update(!finite);
    Ok(finite.then_some(grads))
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::decode::observer::{NullObserver, RecordingObserver};
    use crate::scoring::mocks::{FixedLoss, LetterTokenizer, MockModel, TargetTokenLoss};
    use crate::scoring::{LossOutput, ScoringModel};
    use crate::target::{TargetInit, TargetSettings};

    const VOCAB: usize = 6;

    fn settings(steps: usize, betas: Vec<f64>) -> LoopSettings {
        LoopSettings {
            optim_steps: steps,
            optimizer: OptimizerKind::ExpGd,
            lr: 1.0,
            lambda_lr: 1.0,
            dampness: 0.0,
            betas,
            linear_scale: false,
            precision: Precision::Full,
            show_all_outputs: true,
        }
    }

    fn model() -> Arc<MockModel> {
        Arc::new(MockModel::identity("mock", VOCAB, &Device::Cpu).unwrap())
    }

    fn uniform_target(length: usize, rng: &mut StdRng) -> RelaxedTarget {
        RelaxedTarget::new(
            1,
            length,
            VOCAB,
            &TargetSettings::default(),
            &TargetInit::Zeros,
            &Device::Cpu,
            rng,
        )
        .unwrap()
    }

    /// Loss large enough that any scaled gradient overflows f32.
    struct OverflowingLoss {
        model: Arc<MockModel>,
    }

    impl Objective for OverflowingLoss {
        fn name(&self) -> &str {
            "overflowing"
        }

        fn model(&self) -> &dyn ScoringModel {
            &*self.model
        }

        fn compute_gold_loss(
            &self,
            _ctx: &LossContext,
            _predicted: &[u32],
            _label: usize,
        ) -> Result<(f64, LossOutput)> {
            Ok((0.0, LossOutput::default()))
        }

        fn compute_loss(
            &self,
            _ctx: &LossContext,
            relaxed: &RelaxedInputs<'_>,
            _label: usize,
            _embed_scale: f64,
        ) -> Result<(Tensor, LossOutput)> {
            let loss = relaxed
                .probs
                .to_dtype(DType::F32)?
                .sum((1, 2))?
                .affine(1e36, 0.0)?;
            Ok((loss, LossOutput::default()))
        }
    }

    fn logit_target(length: usize, rng: &mut StdRng) -> RelaxedTarget {
        let settings = TargetSettings {
            kind: TargetKind::Simplex,
            ..TargetSettings::default()
        };
        RelaxedTarget::new(
            1,
            length,
            VOCAB,
            &settings,
            &TargetInit::Zeros,
            &Device::Cpu,
            rng,
        )
        .unwrap()
    }

    #[test]
    fn test_single_objective_descends_to_target_token() {
        let slots = vec![ObjectiveSlot::new(
            "tok",
            Arc::new(TargetTokenLoss::new(model(), 3)),
            0,
        )];
        let settings = settings(20, vec![1.0]);
        let ctx = LossContext::default();
        let tokenizer = LetterTokenizer::new(VOCAB, 5);
        let recorder = RecordingObserver::new();
        let cancel = CancelFlag::new();
        let run = DualOptimization {
            slots: &slots,
            schedules: &[],
            settings: &settings,
            ctx: &ctx,
            tokenizer: &tokenizer,
            observer: &recorder,
            cancel: &cancel,
            example: 0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let target = uniform_target(3, &mut rng);
        let outcome = run.run(&target, &mut rng).unwrap();

        assert_eq!(outcome.state, LoopState::Done);
        assert_eq!(outcome.steps_run, 20);
        let best = outcome.best.unwrap();
        assert_eq!(best.tokens, vec![3, 3, 3]);
        assert_eq!(best.text, "ddd");
        assert!(best.loss < 0.5);

        let events = recorder.events();
        assert_eq!(events.len(), 20);
        assert!(events.iter().all(|e| e.multipliers.is_empty()));
        let bests: Vec<f64> = events.iter().filter_map(|e| e.best_loss).collect();
        assert!(bests.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_probability_rows_stay_on_simplex() {
        for optimizer in [OptimizerKind::ExpGd, OptimizerKind::Sgd, OptimizerKind::Adam] {
            let slots = vec![ObjectiveSlot::new(
                "tok",
                Arc::new(TargetTokenLoss::new(model(), 1)),
                0,
            )];
            let settings = LoopSettings {
                optimizer,
                lr: 0.3,
                ..settings(5, vec![1.0])
            };
            let ctx = LossContext::default();
            let tokenizer = LetterTokenizer::new(VOCAB, 5);
            let cancel = CancelFlag::new();
            let run = DualOptimization {
                slots: &slots,
                schedules: &[],
                settings: &settings,
                ctx: &ctx,
                tokenizer: &tokenizer,
                observer: &NullObserver,
                cancel: &cancel,
                example: 0,
            };
            let mut rng = StdRng::seed_from_u64(3);
            let target = uniform_target(2, &mut rng);
            run.run(&target, &mut rng).unwrap();
            let dist = target.distribution().unwrap();
            let sums = dist
                .sum(candle_core::D::Minus1)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap();
            assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-4), "{optimizer}: {sums:?}");
            let values = dist.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(values.iter().all(|v| *v >= -1e-6), "{optimizer}");
        }
    }

    #[test]
    fn test_violated_constraint_raises_multiplier() {
        let m = model();
        let slots = vec![
            ObjectiveSlot::new("fixed", Arc::new(FixedLoss::new(Arc::clone(&m), 1.0)), 0),
            ObjectiveSlot::new("tok", Arc::new(TargetTokenLoss::new(m, 2)), 0),
        ];
        let schedules = [EpsilonSchedule::constant(0.0)];
        let settings = settings(3, vec![1.0, 0.0]);
        let ctx = LossContext::default();
        let tokenizer = LetterTokenizer::new(VOCAB, 5);
        let recorder = RecordingObserver::new();
        let cancel = CancelFlag::new();
        let run = DualOptimization {
            slots: &slots,
            schedules: &schedules,
            settings: &settings,
            ctx: &ctx,
            tokenizer: &tokenizer,
            observer: &recorder,
            cancel: &cancel,
            example: 0,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let target = uniform_target(2, &mut rng);
        run.run(&target, &mut rng).unwrap();

        let events = recorder.events();
        assert_eq!(events.len(), 3);
        assert!(!events[0].satisfied[0]);
        assert!(events[0].multipliers[0] > 0.0);
        assert!(events.iter().all(|e| e.multipliers.iter().all(|&l| l >= 0.0)));
    }

    #[test]
    fn test_satisfied_constraint_keeps_multiplier_at_zero() {
        let m = model();
        let slots = vec![
            ObjectiveSlot::new("tok", Arc::new(TargetTokenLoss::new(Arc::clone(&m), 2)), 0),
            ObjectiveSlot::new("fixed", Arc::new(FixedLoss::new(m, 0.5)), 0),
        ];
        let schedules = [EpsilonSchedule::constant(1.0)];
        let settings = settings(4, vec![1.0, 0.0]);
        let ctx = LossContext::default();
        let tokenizer = LetterTokenizer::new(VOCAB, 5);
        let recorder = RecordingObserver::new();
        let cancel = CancelFlag::new();
        let run = DualOptimization {
            slots: &slots,
            schedules: &schedules,
            settings: &settings,
            ctx: &ctx,
            tokenizer: &tokenizer,
            observer: &recorder,
            cancel: &cancel,
            example: 0,
        };
        let mut rng = StdRng::seed_from_u64(2);
        let target = uniform_target(2, &mut rng);
        let outcome = run.run(&target, &mut rng).unwrap();

        for event in recorder.events() {
            assert!(event.all_satisfied());
            assert_eq!(event.multipliers, vec![0.0]);
        }
        assert!(outcome.best.unwrap().all_satisfied());
        assert!(!outcome.satisfying_texts.is_empty());
    }

    #[test]
    fn test_cancel_ends_loop_and_rearms() {
        let slots = vec![ObjectiveSlot::new(
            "tok",
            Arc::new(TargetTokenLoss::new(model(), 3)),
            0,
        )];
        let settings = settings(10, vec![1.0]);
        let ctx = LossContext::default();
        let tokenizer = LetterTokenizer::new(VOCAB, 5);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let run = DualOptimization {
            slots: &slots,
            schedules: &[],
            settings: &settings,
            ctx: &ctx,
            tokenizer: &tokenizer,
            observer: &NullObserver,
            cancel: &cancel,
            example: 0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let target = uniform_target(2, &mut rng);
        let outcome = run.run(&target, &mut rng).unwrap();
        assert_eq!(outcome.state, LoopState::Interrupted);
        assert_eq!(outcome.steps_run, 0);
        assert!(outcome.best.is_none());
        assert!(!cancel.is_cancelled());

        let outcome = run.run(&target, &mut rng).unwrap();
        assert_eq!(outcome.state, LoopState::Done);
        assert_eq!(outcome.steps_run, 10);
    }

    #[test]
    fn test_prefix_is_part_of_decoded_text() {
        let slots = vec![ObjectiveSlot::new(
            "tok",
            Arc::new(TargetTokenLoss::new(model(), 0)),
            0,
        )];
        let settings = settings(2, vec![1.0]);
        let ctx = LossContext {
            target_prefix: vec![1, 2],
            ..LossContext::default()
        };
        let tokenizer = LetterTokenizer::new(VOCAB, 5);
        let cancel = CancelFlag::new();
        let run = DualOptimization {
            slots: &slots,
            schedules: &[],
            settings: &settings,
            ctx: &ctx,
            tokenizer: &tokenizer,
            observer: &NullObserver,
            cancel: &cancel,
            example: 0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let target = RelaxedTarget::new(
            1,
            1,
            VOCAB,
            &TargetSettings::default(),
            &TargetInit::Reference(vec![vec![0]]),
            &Device::Cpu,
            &mut rng,
        )
        .unwrap();
        let best = run.run(&target, &mut rng).unwrap().best.unwrap();
        assert_eq!(best.tokens, vec![0]);
        assert_eq!(best.text, "bca");
    }

    #[test]
    fn test_mismatched_schedules_are_rejected() {
        let slots = vec![ObjectiveSlot::new(
            "tok",
            Arc::new(TargetTokenLoss::new(model(), 0)),
            0,
        )];
        let settings = settings(1, vec![1.0]);
        let ctx = LossContext::default();
        let tokenizer = LetterTokenizer::new(VOCAB, 5);
        let cancel = CancelFlag::new();
        let schedules = [EpsilonSchedule::constant(1.0)];
        let run = DualOptimization {
            slots: &slots,
            schedules: &schedules,
            settings: &settings,
            ctx: &ctx,
            tokenizer: &tokenizer,
            observer: &NullObserver,
            cancel: &cancel,
            example: 0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let target = uniform_target(1, &mut rng);
        assert!(run.run(&target, &mut rng).is_err());
    }
    #[test]
    fn test_logit_target_descends_with_adam() {
        let slots = vec![ObjectiveSlot::new(
            "tok",
            Arc::new(TargetTokenLoss::new(model(), 3)),
            0,
        )];
        let settings = LoopSettings {
            optimizer: OptimizerKind::Adam,
            lr: 0.5,
            ..settings(20, vec![1.0])
        };
        let ctx = LossContext::default();
        let tokenizer = LetterTokenizer::new(VOCAB, 5);
        let cancel = CancelFlag::new();
        let run = DualOptimization {
            slots: &slots,
            schedules: &[],
            settings: &settings,
            ctx: &ctx,
            tokenizer: &tokenizer,
            observer: &NullObserver,
            cancel: &cancel,
            example: 0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let target = logit_target(3, &mut rng);
        let best = run.run(&target, &mut rng).unwrap().best.unwrap();
        assert_eq!(best.tokens, vec![3, 3, 3]);
        assert!(best.loss < 0.5);

        let logits = target
            .var()
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(logits.iter().all(|v| v.is_finite()));
        // Logits are not renormalized into probabilities.
        assert!(logits.iter().any(|v| *v < 0.0));
    }

    #[test]
    fn test_exponentiated_gradient_rejects_logit_target() {
        let slots = vec![ObjectiveSlot::new(
            "tok",
            Arc::new(TargetTokenLoss::new(model(), 3)),
            0,
        )];
        let settings = settings(5, vec![1.0]);
        let ctx = LossContext::default();
        let tokenizer = LetterTokenizer::new(VOCAB, 5);
        let recorder = RecordingObserver::new();
        let cancel = CancelFlag::new();
        let run = DualOptimization {
            slots: &slots,
            schedules: &[],
            settings: &settings,
            ctx: &ctx,
            tokenizer: &tokenizer,
            observer: &recorder,
            cancel: &cancel,
            example: 0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let target = logit_target(2, &mut rng);
        assert!(run.run(&target, &mut rng).is_err());
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_linear_scale_minimizes_weighted_sum_without_multipliers() {
        let m = model();
        let slots = vec![
            ObjectiveSlot::new("tok", Arc::new(TargetTokenLoss::new(Arc::clone(&m), 2)), 0),
            ObjectiveSlot::new("fixed", Arc::new(FixedLoss::new(m, 1.0)), 0),
        ];
        let schedules = [EpsilonSchedule::constant(0.0)];
        let settings = LoopSettings {
            linear_scale: true,
            ..settings(4, vec![0.5, 0.5])
        };
        let ctx = LossContext::default();
        let tokenizer = LetterTokenizer::new(VOCAB, 5);
        let recorder = RecordingObserver::new();
        let cancel = CancelFlag::new();
        let run = DualOptimization {
            slots: &slots,
            schedules: &schedules,
            settings: &settings,
            ctx: &ctx,
            tokenizer: &tokenizer,
            observer: &recorder,
            cancel: &cancel,
            example: 0,
        };
        let mut rng = StdRng::seed_from_u64(4);
        let target = uniform_target(2, &mut rng);
        let outcome = run.run(&target, &mut rng).unwrap();

        let events = recorder.events();
        assert_eq!(events.len(), 4);
        for event in &events {
            assert!(event.multipliers.is_empty());
            assert_eq!(event.satisfied, vec![false]);
            assert!((event.objective - event.weighted_loss).abs() < 1e-5);
            let expected = 0.5 * event.losses[0] + 0.5 * event.losses[1];
            assert!((event.weighted_loss - expected).abs() < 1e-9);
        }
        // The constraint is never satisfied, but the primary term still descends.
        assert!(events[3].losses[0] < events[0].losses[0]);
        assert!(outcome.satisfying_texts.is_empty());
    }

    #[test]
    fn test_half_precision_steps_through_loss_scaler() {
        let slots = vec![ObjectiveSlot::new(
            "tok",
            Arc::new(TargetTokenLoss::new(model(), 3)),
            0,
        )];
        let settings = LoopSettings {
            precision: Precision::Half,
            ..settings(20, vec![1.0])
        };
        let ctx = LossContext::default();
        let tokenizer = LetterTokenizer::new(VOCAB, 5);
        let cancel = CancelFlag::new();
        let run = DualOptimization {
            slots: &slots,
            schedules: &[],
            settings: &settings,
            ctx: &ctx,
            tokenizer: &tokenizer,
            observer: &NullObserver,
            cancel: &cancel,
            example: 0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let target = uniform_target(3, &mut rng);
        let best = run.run(&target, &mut rng).unwrap().best.unwrap();
        assert_eq!(best.text, "ddd");
        assert!(best.loss < 0.5);
    }

    #[test]
    fn test_half_precision_skips_non_finite_steps() {
        let slots = vec![ObjectiveSlot::new(
            "big",
            Arc::new(OverflowingLoss { model: model() }),
            0,
        )];
        let settings = LoopSettings {
            precision: Precision::Half,
            ..settings(3, vec![1.0])
        };
        let ctx = LossContext::default();
        let tokenizer = LetterTokenizer::new(VOCAB, 5);
        let recorder = RecordingObserver::new();
        let cancel = CancelFlag::new();
        let run = DualOptimization {
            slots: &slots,
            schedules: &[],
            settings: &settings,
            ctx: &ctx,
            tokenizer: &tokenizer,
            observer: &recorder,
            cancel: &cancel,
            example: 0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let target = uniform_target(2, &mut rng);
        let outcome = run.run(&target, &mut rng).unwrap();

        assert_eq!(outcome.state, LoopState::Done);
        assert_eq!(outcome.steps_run, 3);
        assert_eq!(recorder.events().len(), 3);
        let values = target
            .distribution()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        #[allow(clippy::cast_precision_loss)]
        let uniform = 1.0 / VOCAB as f32;
        assert!(values.iter().all(|v| (v - uniform).abs() < 1e-6), "{values:?}");
    }
}
