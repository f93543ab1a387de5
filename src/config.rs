//! Run configuration: TOML file plus CLI overrides, validated into a [`DecodePlan`].
//!
//! Choice-valued options stay strings here and are parsed during
//! [`DecodeConfig::validate`], so every configuration problem surfaces before
//! any model is loaded.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::decode::SelectionCriterion;
use crate::error::ConfigError;
use crate::optim::OptimizerKind;
use crate::schedule::{DecayFn, EpsilonSchedule};
use crate::target::{SamplingStrategy, TargetKind, TargetSettings};

const BETA_TOLERANCE: f64 = 1e-6;

/// Where the relaxed target starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPolicy {
    #[default]
    Zeros,
    Random,
    /// Near-one-hot around the source text.
    Source,
    /// Near-one-hot around the reference target text.
    Target,
}

impl InitPolicy {
    /// Whether the target length comes from a reference sequence.
    #[must_use]
    pub fn uses_reference(self) -> bool {
        matches!(self, Self::Source | Self::Target)
    }
}

impl FromStr for InitPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zeros" | "zero" | "uniform" => Ok(Self::Zeros),
            "random" => Ok(Self::Random),
            "source" => Ok(Self::Source),
            "target" => Ok(Self::Target),
            other => Err(ConfigError::UnknownInit(other.to_string())),
        }
    }
}

impl fmt::Display for InitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Zeros => "zeros",
            Self::Random => "random",
            Self::Source => "source",
            Self::Target => "target",
        })
    }
}

/// Numeric precision of the scoring models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Full,
    /// Half-precision weights with dynamic loss scaling.
    Half,
}

impl Precision {
    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::Full => DType::F32,
            Self::Half => DType::F16,
        }
    }
}

impl FromStr for Precision {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "fp32" | "f32" => Ok(Self::Full),
            "half" | "fp16" | "f16" => Ok(Self::Half),
            other => Err(ConfigError::UnknownPrecision(other.to_string())),
        }
    }
}

/// Raw options, as read from TOML and overridden on the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(clippy::struct_excessive_bools)]
pub struct DecodeConfig {
    /// Loss names, primary first.
    pub losses: Vec<String>,
    /// Weights file per loss; equal paths share one loaded model.
    pub models: Vec<PathBuf>,
    pub loss_abbrs: Vec<String>,
    pub label_ids: Vec<usize>,
    pub selection_criterion: String,
    pub betas: Vec<f64>,

    pub epsilons: Vec<f64>,
    pub min_epsilons: Vec<f64>,
    pub epsilon_warmup_steps: Vec<usize>,
    pub epsilon_cooldown_steps: Vec<usize>,
    pub epsilon_decay_functions: Vec<String>,
    /// Replace each constraint floor by the baseline's own loss.
    pub gold_loss_epsilons: bool,

    pub optim_steps: usize,
    pub optimizer: String,
    pub lr: f64,
    pub lambda_lr: f64,
    pub dampness: f64,

    pub target_type: String,
    pub decode_temperature: f64,
    pub straight_through: bool,
    pub init: String,
    pub init_eps: f64,
    pub dirichlet_concentration: f64,
    pub sampling_strategy: String,
    pub sampling_strategy_k: f64,

    pub max_length: Option<usize>,
    pub length_diff: usize,
    pub max_allowed_length: usize,
    pub prefix_length: usize,
    pub baseline_max_length: usize,
    pub beam_size: usize,

    pub precision: String,
    pub linear_scale: bool,
    pub always_optimize: bool,
    pub allow_diff_vocab: bool,
    pub show_all_outputs: bool,
    pub num_examples: Option<usize>,
    /// Zero-based example indices to skip; nothing is written for them.
    pub debug_skip: Vec<usize>,
    pub seed: Option<u64>,
    pub log_interval: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            losses: vec!["fluency".into(), "style".into()],
            models: Vec::new(),
            loss_abbrs: Vec::new(),
            label_ids: Vec::new(),
            selection_criterion: "primary_allsat".into(),
            betas: Vec::new(),
            epsilons: Vec::new(),
            min_epsilons: Vec::new(),
            epsilon_warmup_steps: Vec::new(),
            epsilon_cooldown_steps: Vec::new(),
            epsilon_decay_functions: Vec::new(),
            gold_loss_epsilons: false,
            optim_steps: 100,
            optimizer: "expgd".into(),
            lr: 1.0,
            lambda_lr: 1.0,
            dampness: 0.0,
            target_type: "probs".into(),
            decode_temperature: 1.0,
            straight_through: false,
            init: "zeros".into(),
            init_eps: 1e-2,
            dirichlet_concentration: 10_000.0,
            sampling_strategy: "greedy".into(),
            sampling_strategy_k: 1.0,
            max_length: None,
            length_diff: 0,
            max_allowed_length: 200,
            prefix_length: 0,
            baseline_max_length: 80,
            beam_size: 1,
            precision: "full".into(),
            linear_scale: false,
            always_optimize: false,
            allow_diff_vocab: false,
            show_all_outputs: false,
            num_examples: None,
            debug_skip: Vec::new(),
            seed: None,
            log_interval: 10,
        }
    }
}

/// One configured objective.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectiveSpec {
    pub loss: String,
    pub model: PathBuf,
    pub abbr: String,
    pub label_id: usize,
}

/// Validated, typed form of [`DecodeConfig`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct DecodePlan {
    pub objectives: Vec<ObjectiveSpec>,
    pub criterion: SelectionCriterion,
    pub betas: Vec<f64>,
    /// One per constraint, in objective order.
    pub schedules: Vec<EpsilonSchedule>,
    pub gold_loss_epsilons: bool,
    pub optim_steps: usize,
    pub optimizer: OptimizerKind,
    pub lr: f64,
    pub lambda_lr: f64,
    pub dampness: f64,
    pub target: TargetSettings,
    pub init: InitPolicy,
    pub max_length: Option<usize>,
    pub length_diff: usize,
    pub max_allowed_length: usize,
    pub prefix_length: usize,
    pub baseline_max_length: usize,
    pub beam_size: usize,
    pub precision: Precision,
    pub linear_scale: bool,
    pub always_optimize: bool,
    pub allow_diff_vocab: bool,
    pub show_all_outputs: bool,
    pub num_examples: Option<usize>,
    pub debug_skip: Vec<usize>,
    pub seed: Option<u64>,
    pub log_interval: usize,
}

impl DecodePlan {
    #[must_use]
    pub fn num_constraints(&self) -> usize {
        self.objectives.len().saturating_sub(1)
    }
}

impl DecodeConfig {
    /// Read a TOML file; absent keys keep their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Check every option and build the typed plan.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found.
    #[allow(clippy::too_many_lines)]
    pub fn validate(&self) -> Result<DecodePlan, ConfigError> {
        let n = self.losses.len();
        if n == 0 {
            return Err(ConfigError::NoObjectives);
        }
        let constraints = n - 1;

        expect_len("models", n, self.models.len())?;
        let abbrs = if self.loss_abbrs.is_empty() {
            default_abbrs(&self.losses)
        } else {
            expect_len("loss_abbrs", n, self.loss_abbrs.len())?;
            self.loss_abbrs.clone()
        };
        let label_ids = if self.label_ids.is_empty() {
            vec![0; n]
        } else {
            expect_len("label_ids", n, self.label_ids.len())?;
            self.label_ids.clone()
        };

        let criterion: SelectionCriterion = self.selection_criterion.parse()?;
        let betas = self.resolve_betas(criterion, n)?;
        let schedules = self.resolve_schedules(constraints)?;

        let optimizer: OptimizerKind = self.optimizer.parse()?;
        positive("lr", self.lr)?;
        non_negative("lambda_lr", self.lambda_lr)?;
        non_negative("dampness", self.dampness)?;

        let kind: TargetKind = self.target_type.parse()?;
        if optimizer == OptimizerKind::ExpGd && kind == TargetKind::Simplex {
            return Err(ConfigError::IncompatibleOptimizer {
                optimizer: optimizer.to_string(),
                target: kind.to_string(),
            });
        }
        positive("decode_temperature", self.decode_temperature)?;
        if !(0.0..1.0).contains(&self.init_eps) {
            let reason = format!("must be in [0, 1), got {}", self.init_eps);
            return Err(invalid("init_eps", reason));
        }
        positive("dirichlet_concentration", self.dirichlet_concentration)?;
        let strategy =
            SamplingStrategy::from_name(&self.sampling_strategy, self.sampling_strategy_k)?;
        let init: InitPolicy = self.init.parse()?;

        at_least_one("max_allowed_length", self.max_allowed_length)?;
        if let Some(max_length) = self.max_length {
            at_least_one("max_length", max_length)?;
        }
        at_least_one("baseline_max_length", self.baseline_max_length)?;
        at_least_one("beam_size", self.beam_size)?;
        at_least_one("log_interval", self.log_interval)?;
        let precision: Precision = self.precision.parse()?;

        let objectives = (0..n)
            .map(|i| ObjectiveSpec {
                loss: self.losses[i].clone(),
                model: self.models[i].clone(),
                abbr: abbrs[i].clone(),
                label_id: label_ids[i],
            })
            .collect();

        Ok(DecodePlan {
            objectives,
            criterion,
            betas,
            schedules,
            gold_loss_epsilons: self.gold_loss_epsilons,
            optim_steps: self.optim_steps,
            optimizer,
            lr: self.lr,
            lambda_lr: self.lambda_lr,
            dampness: self.dampness,
            target: TargetSettings {
                kind,
                temperature: self.decode_temperature,
                straight_through: self.straight_through,
                strategy,
                init_eps: self.init_eps,
                dirichlet_concentration: self.dirichlet_concentration,
            },
            init,
            max_length: self.max_length,
            length_diff: self.length_diff,
            max_allowed_length: self.max_allowed_length,
            prefix_length: self.prefix_length,
            baseline_max_length: self.baseline_max_length,
            beam_size: self.beam_size,
            precision,
            linear_scale: self.linear_scale,
            always_optimize: self.always_optimize,
            allow_diff_vocab: self.allow_diff_vocab,
            show_all_outputs: self.show_all_outputs,
            num_examples: self.num_examples,
            debug_skip: self.debug_skip.clone(),
            seed: self.seed,
            log_interval: self.log_interval,
        })
    }

    fn resolve_betas(
        &self,
        criterion: SelectionCriterion,
        n: usize,
    ) -> Result<Vec<f64>, ConfigError> {
        let betas = match criterion {
            SelectionCriterion::PrimaryAllsat => {
                let mut forced = vec![0.0; n];
                forced[0] = 1.0;
                if !self.betas.is_empty() && self.betas != forced {
                    tracing::warn!(
                        configured = ?self.betas,
                        "primary_allsat selection ranks by the primary loss only; betas overridden"
                    );
                }
                forced
            }
            SelectionCriterion::WeightedSum => {
                if self.betas.is_empty() {
                    return Err(ConfigError::MissingBetas);
                }
                expect_len("betas", n, self.betas.len())?;
                self.betas.clone()
            }
        };
        if betas.iter().any(|b| !b.is_finite()) {
            return Err(invalid("betas", "every weight must be finite".into()));
        }
        let sum: f64 = betas.iter().sum();
        if (sum - 1.0).abs() >= BETA_TOLERANCE {
            return Err(ConfigError::BetaSum(sum));
        }
        Ok(betas)
    }

    fn resolve_schedules(&self, constraints: usize) -> Result<Vec<EpsilonSchedule>, ConfigError> {
        if constraints == 0 {
            return Ok(Vec::new());
        }
        if self.epsilons.is_empty() {
            return Err(ConfigError::MissingEpsilons(constraints));
        }
        expect_len("epsilons", constraints, self.epsilons.len())?;
        let floors = or_default(
            "min_epsilons",
            &self.min_epsilons,
            constraints,
            &self.epsilons,
        )?;
        let warmup = or_default(
            "epsilon_warmup_steps",
            &self.epsilon_warmup_steps,
            constraints,
            &vec![1; constraints],
        )?;
        let cooldown = or_default(
            "epsilon_cooldown_steps",
            &self.epsilon_cooldown_steps,
            constraints,
            &vec![2; constraints],
        )?;
        let decays = if self.epsilon_decay_functions.is_empty() {
            vec![DecayFn::None; constraints]
        } else {
            expect_len(
                "epsilon_decay_functions",
                constraints,
                self.epsilon_decay_functions.len(),
            )?;
            self.epsilon_decay_functions
                .iter()
                .map(|name| name.parse())
                .collect::<Result<Vec<DecayFn>, _>>()?
        };

        (0..constraints)
            .map(|i| {
                if !self.epsilons[i].is_finite() || !floors[i].is_finite() {
                    let reason = format!("constraint {i} has a non-finite threshold");
                    return Err(invalid("epsilons", reason));
                }
                Ok(EpsilonSchedule {
                    start: self.epsilons[i],
                    floor: floors[i],
                    warmup_steps: warmup[i],
                    cooldown_steps: cooldown[i],
                    decay: decays[i],
                })
            })
            .collect()
    }
}

fn default_abbrs(losses: &[String]) -> Vec<String> {
    losses
        .iter()
        .enumerate()
        .map(|(i, loss)| {
            let repeated = losses.iter().filter(|other| *other == loss).count() > 1;
            if repeated { format!("{loss}{i}") } else { loss.clone() }
        })
        .collect()
}

fn or_default<T: Clone>(
    option: &'static str,
    values: &[T],
    expected: usize,
    fallback: &[T],
) -> Result<Vec<T>, ConfigError> {
    if values.is_empty() {
        return Ok(fallback.to_vec());
    }
    expect_len(option, expected, values.len())?;
    Ok(values.to_vec())
}

fn expect_len(option: &'static str, expected: usize, found: usize) -> Result<(), ConfigError> {
    if expected == found {
        Ok(())
    } else {
        Err(ConfigError::CountMismatch {
            option,
            expected,
            found,
        })
    }
}

fn invalid(option: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { option, reason }
}

fn positive(option: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(option, format!("must be positive, got {value}")))
    }
}

fn non_negative(option: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(option, format!("must be non-negative, got {value}")))
    }
}

fn at_least_one(option: &'static str, value: usize) -> Result<(), ConfigError> {
    if value >= 1 {
        Ok(())
    } else {
        Err(invalid(option, "must be at least 1".into()))
    }
}
