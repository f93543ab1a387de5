//! Interfaces the decoding core uses to reach its collaborators.
//!
//! Scoring models, objectives, the baseline generator and the tokenizer are
//! all behind traits; the core never branches on a concrete model type.

pub mod fluency;
#[cfg(any(test, feature = "test-support"))]
pub mod mocks;
pub mod registry;
pub mod style;

use candle_core::{DType, Result, Tensor};

pub use fluency::FluencyLoss;
pub use registry::{ModelRegistry, check_vocabularies};
pub use style::StyleLoss;

use crate::target::{EmbeddingTable, mix_embeddings, one_hot};

/// A differentiable model whose input embeddings the target can feed.
pub trait ScoringModel {
    /// Identity used to share one loaded model across objectives.
    fn name(&self) -> &str;

    /// `(vocab, dim)` input embedding matrix.
    fn embedding_table(&self) -> &Tensor;

    fn vocab_size(&self) -> usize;

    /// Factor applied to mixed embeddings before they enter the model.
    fn embedding_scale(&self) -> f64 {
        1.0
    }

    /// Whether output text is tokenized differently from input text.
    fn uses_separate_target_tokenizer(&self) -> bool {
        false
    }

    /// Longest input sequence one forward pass accepts, context included.
    fn max_sequence_length(&self) -> Option<usize> {
        None
    }
}

/// Discrete conditioning shared by every objective for one example.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LossContext {
    /// Source ids, special tokens included.
    pub source: Vec<u32>,
    /// Fixed output prefix placed before the optimized tokens.
    pub target_prefix: Vec<u32>,
    pub additional: Vec<u32>,
}

impl LossContext {
    /// Source followed by the fixed prefix.
    #[must_use]
    pub fn conditioning(&self) -> Vec<u32> {
        self.source
            .iter()
            .chain(&self.target_prefix)
            .copied()
            .collect()
    }
}

/// Views of the relaxed target handed to [`Objective::compute_loss`].
pub struct RelaxedInputs<'a> {
    /// `(batch, length)` decoded ids.
    pub tokens: &'a Tensor,
    /// `(batch, length, dim)` mixed embeddings for this objective's model.
    pub embeddings: &'a Tensor,
    /// `(batch, length, vocab)` distribution, straight-through adjusted.
    pub probs: &'a Tensor,
    pub soft_probs: &'a Tensor,
}

/// Side information returned with a loss.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossOutput {
    pub predicted_label: Option<usize>,
    pub token_logprobs: Option<Vec<f32>>,
}

/// One term of the optimization problem: the primary loss or a constraint.
pub trait Objective {
    fn name(&self) -> &str;

    fn model(&self) -> &dyn ScoringModel;

    /// Loss of a discrete candidate.
    ///
    /// # Errors
    /// Returns an error if the model evaluation fails.
    fn compute_gold_loss(
        &self,
        ctx: &LossContext,
        predicted: &[u32],
        label: usize,
    ) -> Result<(f64, LossOutput)>;

    /// Per-example `(batch,)` loss of the relaxed target, differentiable
    /// with respect to `relaxed.embeddings` and `relaxed.probs`.
    ///
    /// # Errors
    /// Returns an error if the model evaluation fails.
    fn compute_loss(
        &self,
        ctx: &LossContext,
        relaxed: &RelaxedInputs<'_>,
        label: usize,
        embed_scale: f64,
    ) -> Result<(Tensor, LossOutput)>;
}

/// Produces the autoregressive baseline candidate.
pub trait BaselineGenerator {
    /// Continue `input` for at most `max_length` tokens with `num_beams` beams.
    /// Returns only the generated ids; they may end with EOS.
    ///
    /// # Errors
    /// Returns an error if the model evaluation fails.
    fn generate(&self, input: &[u32], max_length: usize, num_beams: usize) -> Result<Vec<u32>>;
}

pub trait TextTokenizer {
    /// Encode as a model input, special tokens included.
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Encode without any special tokens.
    fn encode_plain(&self, text: &str) -> Vec<u32>;

    /// Encode text on the output side.
    fn encode_target(&self, text: &str) -> Vec<u32> {
        self.encode_plain(text)
    }

    fn decode(&self, ids: &[u32]) -> String;

    fn eos_id(&self) -> u32;

    fn vocab_size(&self) -> usize;
}

/// Ids up to, not including, the first `eos`.
#[must_use]
pub fn clean_output(ids: &[u32], eos: u32) -> &[u32] {
    let end = ids.iter().position(|&id| id == eos).unwrap_or(ids.len());
    &ids[..end]
}

/// Evaluate a discrete candidate through the relaxed path using one-hot rows.
///
/// # Errors
/// Returns an error for an empty candidate or a failed evaluation.
pub fn gold_loss_via_one_hot(
    objective: &dyn Objective,
    ctx: &LossContext,
    predicted: &[u32],
    label: usize,
) -> Result<(f64, LossOutput)> {
    if predicted.is_empty() {
        candle_core::bail!("cannot score an empty candidate");
    }
    let model = objective.model();
    let table = EmbeddingTable::from_model(model);
    let device = table.weight.device();
    let rows = vec![predicted.to_vec()];

    let probs = one_hot(&rows, model.vocab_size(), device)?;
    let embeddings = mix_embeddings(&probs, &table)?;
    let tokens = Tensor::new(rows, device)?;
    let inputs = RelaxedInputs {
        tokens: &tokens,
        embeddings: &embeddings,
        probs: &probs,
        soft_probs: &probs,
    };
    let (loss, output) = objective.compute_loss(ctx, &inputs, label, table.scale)?;
    Ok((scalar(&loss)?, output))
}

/// Sum of a tensor as `f64`.
///
/// # Errors
/// Returns an error if the reduction fails.
pub fn scalar(t: &Tensor) -> Result<f64> {
    Ok(f64::from(
        t.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?,
    ))
}
