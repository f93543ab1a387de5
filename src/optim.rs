//! Update rules for the relaxed target (descent) and the multipliers (ascent).
//!
//! Every rule implements [`candle_nn::Optimizer`] so the loop can drive them
//! uniformly from a per-step [`GradStore`].

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use candle_core::backprop::GradStore;
use candle_core::{D, DType, Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Primal optimizer choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
    /// Exponentiated gradient; keeps probability rows on the simplex.
    #[default]
    #[serde(rename = "expgd")]
    ExpGd,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "adam" | "adamw" => Ok(Self::Adam),
            "expgd" => Ok(Self::ExpGd),
            other => Err(ConfigError::UnknownOptimizer(other.to_string())),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sgd => "sgd",
            Self::Adam => "adam",
            Self::ExpGd => "expgd",
        })
    }
}

/// Multiplicative update `p ← p · exp(−lr · g)` followed by row normalization.
pub struct ExponentiatedGradient {
    vars: Vec<Var>,
    learning_rate: f64,
}

impl Optimizer for ExponentiatedGradient {
    type Config = f64;

    fn new(vars: Vec<Var>, learning_rate: f64) -> Result<Self> {
        let vars = vars.into_iter().filter(|v| v.dtype().is_float()).collect();
        Ok(Self {
            vars,
            learning_rate,
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for var in &self.vars {
            let Some(grad) = grads.get(var) else {
                continue;
            };
            // Shifting the exponent by its row max leaves the normalized result unchanged.
            let exponent = grad.affine(-self.learning_rate, 0.0)?;
            let exponent = exponent.broadcast_sub(&exponent.max_keepdim(D::Minus1)?)?;
            let scaled = (var.as_tensor() * exponent.exp()?)?;
            let norm = scaled.sum_keepdim(D::Minus1)?;
            var.set(&scaled.broadcast_div(&norm)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}

/// Plain gradient ascent, used for the multipliers.
pub struct GradientAscent {
    vars: Vec<Var>,
    learning_rate: f64,
}

impl Optimizer for GradientAscent {
    type Config = f64;

    fn new(vars: Vec<Var>, learning_rate: f64) -> Result<Self> {
        let vars = vars.into_iter().filter(|v| v.dtype().is_float()).collect();
        Ok(Self {
            vars,
            learning_rate,
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for var in &self.vars {
            if let Some(grad) = grads.get(var) {
                var.set(&var.add(&(grad * self.learning_rate)?)?)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}

/// Descent optimizer over the relaxed target.
pub enum PrimalOptimizer {
    Sgd(SGD),
    Adam(AdamW),
    ExpGd(ExponentiatedGradient),
}

impl PrimalOptimizer {
    /// Build the optimizer of `kind` over `var`.
    ///
    /// # Errors
    /// Returns an error if the underlying optimizer rejects its parameters.
    pub fn new(kind: OptimizerKind, var: Var, learning_rate: f64) -> Result<Self> {
        Ok(match kind {
            OptimizerKind::Sgd => Self::Sgd(SGD::new(vec![var], learning_rate)?),
            OptimizerKind::Adam => {
                let params = ParamsAdamW {
                    lr: learning_rate,
                    weight_decay: 0.0,
                    ..ParamsAdamW::default()
                };
                Self::Adam(AdamW::new(vec![var], params)?)
            }
            OptimizerKind::ExpGd => {
                Self::ExpGd(ExponentiatedGradient::new(vec![var], learning_rate)?)
            }
        })
    }

    /// Apply one update from `grads`.
    ///
    /// # Errors
    /// Returns an error if a tensor update fails.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::Sgd(opt) => opt.step(grads),
            Self::Adam(opt) => opt.step(grads),
            Self::ExpGd(opt) => opt.step(grads),
        }
    }

    /// Whether updates stay on the probability simplex without projection.
    #[must_use]
    pub fn keeps_simplex(&self) -> bool {
        matches!(self, Self::ExpGd(_))
    }
}

/// Euclidean projection of every last-dimension row of `var` onto the probability simplex.
///
/// # Errors
/// Returns an error if the values cannot be read or written back.
pub fn project_to_simplex(var: &Var) -> Result<()> {
    let dims = var.dims().to_vec();
    let Some(&width) = dims.last() else {
        return Ok(());
    };
    if width == 0 {
        return Ok(());
    }
    let mut values = var
        .as_tensor()
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    for row in values.chunks_mut(width) {
        project_row(row);
    }
    let projected = Tensor::from_vec(values, dims, var.device())?.to_dtype(var.dtype())?;
    var.set(&projected)
}

#[allow(clippy::cast_precision_loss)]
fn project_row(row: &mut [f32]) {
    let mut sorted = row.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));

    let mut cumulative = 0.0_f32;
    let mut theta = 0.0_f32;
    for (j, &u) in sorted.iter().enumerate() {
        cumulative += u;
        let candidate = (cumulative - 1.0) / (j + 1) as f32;
        if u - candidate > 0.0 {
            theta = candidate;
        }
    }
    for v in row.iter_mut() {
        *v = (*v - theta).max(0.0);
    }
}

/// Dynamic loss scaling for reduced-precision steps.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    clean_steps: usize,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self {
            scale: 65_536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2_000,
            clean_steps: 0,
        }
    }
}

impl LossScaler {
    #[must_use]
    pub fn with_scale(scale: f64) -> Self {
        Self {
            scale,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Multiply `loss` by the current scale before backpropagation.
    ///
    /// # Errors
    /// Returns an error if the tensor op fails.
    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        loss.affine(self.scale, 0.0)
    }

    /// Divide the gradients of `vars` by the scale, in place.
    ///
    /// Returns `false` when any unscaled gradient holds a non-finite value,
    /// in which case the caller should skip the update.
    ///
    /// # Errors
    /// Returns an error if a gradient cannot be rescaled.
    pub fn unscale(&self, grads: &mut GradStore, vars: &[&Var]) -> Result<bool> {
        let inverse = 1.0 / self.scale;
        let mut finite = true;
        for var in vars {
            let Some(grad) = grads.remove(var.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?.affine(inverse, 0.0)?;
            let magnitude = grad.abs()?.sum_all()?.to_scalar::<f32>()?;
            finite &= magnitude.is_finite();
            grads.insert(var.as_tensor(), grad);
        }
        Ok(finite)
    }

    /// Back off after an overflow, grow after enough clean steps.
    pub fn update(&mut self, found_non_finite: bool) {
        if found_non_finite {
            self.scale = (self.scale * self.backoff_factor).max(1.0);
            self.clean_steps = 0;
            tracing::debug!(scale = self.scale, "loss scale backed off");
            return;
        }
        self.clean_steps += 1;
        if self.clean_steps >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.clean_steps = 0;
        }
    }
}
