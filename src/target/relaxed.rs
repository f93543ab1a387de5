//! Continuous stand-in for a discrete output sequence.
//!
//! The state is a `(batch, length, vocab)` tensor holding either logits
//! (softmaxed with a temperature) or probabilities kept on the simplex by the
//! optimizer. Each forward pass yields one mixed embedding per scoring model,
//! the decoded tokens, and the distribution used for expectations.

use std::fmt;
use std::str::FromStr;

use candle_core::{D, DType, Device, Result, Tensor, Var};
use rand::Rng;
use rand_distr::{Dirichlet, Distribution};
use serde::{Deserialize, Serialize};

use super::sampling::{SamplingStrategy, sample_row};
use crate::error::ConfigError;
use crate::scoring::ScoringModel;

/// Parameterization of the relaxed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Unnormalized scores, softmaxed with a temperature.
    Simplex,
    /// Rows stored directly as probabilities.
    #[default]
    #[serde(rename = "probs")]
    Probability,
}

impl FromStr for TargetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simplex" | "logits" => Ok(Self::Simplex),
            "probs" | "probability" => Ok(Self::Probability),
            other => Err(ConfigError::UnknownTarget(other.to_string())),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simplex => "simplex",
            Self::Probability => "probs",
        })
    }
}

/// Fixed settings shared by every target built for a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSettings {
    pub kind: TargetKind,
    /// Softmax temperature in simplex mode.
    pub temperature: f64,
    pub straight_through: bool,
    pub strategy: SamplingStrategy,
    /// Mass spread over non-reference ids by [`TargetInit::Reference`].
    pub init_eps: f64,
    pub dirichlet_concentration: f64,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            kind: TargetKind::Probability,
            temperature: 1.0,
            straight_through: false,
            strategy: SamplingStrategy::Greedy,
            init_eps: 1e-2,
            dirichlet_concentration: 10_000.0,
        }
    }
}

/// Starting point of the relaxed state.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetInit {
    /// Zero logits, or uniform rows in probability mode.
    Zeros,
    /// Uniform noise logits, or Dirichlet-sampled rows in probability mode.
    Random,
    /// Near-one-hot rows around reference ids, one id list per batch entry.
    Reference(Vec<Vec<u32>>),
}

/// Embedding matrix of one scoring model plus the factor applied after mixing.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    pub weight: Tensor,
    pub scale: f64,
}

impl EmbeddingTable {
    #[must_use]
    pub fn new(weight: Tensor, scale: f64) -> Self {
        Self { weight, scale }
    }

    #[must_use]
    pub fn from_model(model: &dyn ScoringModel) -> Self {
        Self::new(model.embedding_table().clone(), model.embedding_scale())
    }
}

/// Everything one forward pass of the target produces.
pub struct RelaxedOutput {
    /// One `(batch, length, dim)` mixed embedding per table, in table order.
    pub embeddings: Vec<Tensor>,
    pub tokens: Vec<Vec<u32>>,
    /// `tokens` as a `(batch, length)` u32 tensor.
    pub token_ids: Tensor,
    /// Distribution used downstream; straight-through adjusted when enabled.
    pub probs: Tensor,
    /// Plain soft distribution.
    pub soft_probs: Tensor,
}

pub struct RelaxedTarget {
    param: Var,
    settings: TargetSettings,
    batch: usize,
    length: usize,
    vocab: usize,
}

impl RelaxedTarget {
    /// Allocate a fresh `(batch, length, vocab)` target.
    ///
    /// # Errors
    /// Returns an error for an empty shape, a reference that does not match
    /// the shape or vocabulary, or a failed allocation.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(
        batch: usize,
        length: usize,
        vocab: usize,
        settings: &TargetSettings,
        init: &TargetInit,
        device: &Device,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if batch == 0 || length == 0 || vocab == 0 {
            candle_core::bail!(
                "relaxed target needs a non-empty shape, got ({batch}, {length}, {vocab})"
            );
        }
        let cells = batch * length * vocab;
        let values = match (init, settings.kind) {
            (TargetInit::Zeros, TargetKind::Simplex) => vec![0.0; cells],
            (TargetInit::Zeros, TargetKind::Probability) => vec![1.0 / vocab as f32; cells],
            (TargetInit::Random, TargetKind::Simplex) => {
                (0..cells).map(|_| rng.r#gen::<f32>()).collect()
            }
            (TargetInit::Random, TargetKind::Probability) => {
                dirichlet_rows(batch * length, vocab, settings.dirichlet_concentration, rng)?
            }
            (TargetInit::Reference(ids), kind) => {
                reference_rows(ids, batch, length, vocab, settings.init_eps, kind)?
            }
        };
        let param = Var::from_tensor(&Tensor::from_vec(values, (batch, length, vocab), device)?)?;
        Ok(Self {
            param,
            settings: settings.clone(),
            batch,
            length,
            vocab,
        })
    }

    /// The trainable state, for the primal optimizer.
    #[must_use]
    pub fn var(&self) -> &Var {
        &self.param
    }

    #[must_use]
    pub fn kind(&self) -> TargetKind {
        self.settings.kind
    }

    #[must_use]
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.batch, self.length, self.vocab)
    }

    /// Current soft distribution, `(batch, length, vocab)`.
    ///
    /// # Errors
    /// Returns an error if the softmax fails.
    pub fn distribution(&self) -> Result<Tensor> {
        match self.settings.kind {
            TargetKind::Simplex => {
                let scaled = self.param.as_tensor().affine(1.0 / self.settings.temperature, 0.0)?;
                candle_nn::ops::softmax(&scaled, D::Minus1)
            }
            TargetKind::Probability => Ok(self.param.as_tensor().clone()),
        }
    }

    /// Decode the state and mix one embedding per table.
    ///
    /// # Errors
    /// Returns an error if any tensor op fails.
    pub fn forward(&self, tables: &[EmbeddingTable], rng: &mut impl Rng) -> Result<RelaxedOutput> {
        let device = self.param.device();
        let soft_probs = self.distribution()?;

        let rows = soft_probs.to_dtype(DType::F32)?.to_vec3::<f32>()?;
        let tokens: Vec<Vec<u32>> = rows
            .iter()
            .map(|seq| {
                seq.iter()
                    .map(|row| sample_row(row, self.settings.strategy, rng))
                    .collect()
            })
            .collect();
        let token_ids = Tensor::new(tokens.clone(), device)?;

        let probs = if self.settings.straight_through {
            let hard = one_hot(&tokens, self.vocab, device)?;
            hard.sub(&soft_probs.detach())?.add(&soft_probs)?
        } else {
            soft_probs.clone()
        };

        let embeddings = tables
            .iter()
            .map(|table| mix_embeddings(&probs, table))
            .collect::<Result<Vec<_>>>()?;

        Ok(RelaxedOutput {
            embeddings,
            tokens,
            token_ids,
            probs,
            soft_probs,
        })
    }
}

/// Expected embedding `probs @ table * scale`, truncated to the shared vocabulary.
///
/// # Errors
/// Returns an error if shapes are not `(b, l, v)` and `(v', d)`.
pub fn mix_embeddings(probs: &Tensor, table: &EmbeddingTable) -> Result<Tensor> {
    let (b, l, v) = probs.dims3()?;
    let (table_vocab, dim) = table.weight.dims2()?;
    let shared = v.min(table_vocab);

    let probs = if shared < v {
        probs.narrow(D::Minus1, 0, shared)?
    } else {
        probs.clone()
    };
    let weight = if shared < table_vocab {
        table.weight.narrow(0, 0, shared)?
    } else {
        table.weight.clone()
    };

    let mixed = probs
        .to_dtype(weight.dtype())?
        .contiguous()?
        .reshape((b * l, shared))?
        .matmul(&weight.contiguous()?)?
        .reshape((b, l, dim))?;
    if (table.scale - 1.0).abs() > f64::EPSILON {
        mixed.affine(table.scale, 0.0)
    } else {
        Ok(mixed)
    }
}

/// One-hot `(batch, length, vocab)` f32 tensor for equal-length id rows.
///
/// # Errors
/// Returns an error for ragged rows or an id outside the vocabulary.
pub fn one_hot(ids: &[Vec<u32>], vocab: usize, device: &Device) -> Result<Tensor> {
    let batch = ids.len();
    let length = ids.first().map_or(0, Vec::len);
    let mut values = vec![0f32; batch * length * vocab];
    for (b, row) in ids.iter().enumerate() {
        if row.len() != length {
            candle_core::bail!("ragged id rows: {} vs {length}", row.len());
        }
        for (t, &id) in row.iter().enumerate() {
            let id = id as usize;
            if id >= vocab {
                candle_core::bail!("token id {id} outside vocabulary of {vocab}");
            }
            values[(b * length + t) * vocab + id] = 1.0;
        }
    }
    Tensor::from_vec(values, (batch, length, vocab), device)
}

#[allow(clippy::cast_possible_truncation)]
fn dirichlet_rows(
    rows: usize,
    vocab: usize,
    concentration: f64,
    rng: &mut impl Rng,
) -> Result<Vec<f32>> {
    if vocab < 2 {
        return Ok(vec![1.0; rows * vocab]);
    }
    let dirichlet = Dirichlet::new_with_size(concentration, vocab)
        .map_err(|e| candle_core::Error::Msg(format!("dirichlet init: {e}")))?;
    let mut values = Vec::with_capacity(rows * vocab);
    for _ in 0..rows {
        let sample: Vec<f64> = dirichlet.sample(rng);
        values.extend(sample.into_iter().map(|p| p as f32));
    }
    Ok(values)
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn reference_rows(
    ids: &[Vec<u32>],
    batch: usize,
    length: usize,
    vocab: usize,
    eps: f64,
    kind: TargetKind,
) -> Result<Vec<f32>> {
    if ids.len() != batch || ids.iter().any(|row| row.len() != length) {
        candle_core::bail!("reference ids do not match target shape ({batch}, {length})");
    }
    let (on, off) = if vocab > 1 {
        (1.0 - eps, eps / (vocab - 1) as f64)
    } else {
        (1.0, 0.0)
    };
    let (on, off) = match kind {
        TargetKind::Probability => (on as f32, off as f32),
        TargetKind::Simplex => (
            on.max(f64::from(f32::MIN_POSITIVE)).ln() as f32,
            off.max(f64::from(f32::MIN_POSITIVE)).ln() as f32,
        ),
    };

    let mut values = vec![off; batch * length * vocab];
    for (b, row) in ids.iter().enumerate() {
        for (t, &id) in row.iter().enumerate() {
            let id = id as usize;
            if id >= vocab {
                candle_core::bail!("reference id {id} outside vocabulary of {vocab}");
            }
            values[(b * length + t) * vocab + id] = on;
        }
    }
    Ok(values)
}
