//! Deterministic scorers and generator for exercising the decoding loop
//! without real weights.

use std::cell::Cell;
use std::sync::Arc;

use candle_core::{D, DType, Device, Result, Tensor};

use super::{LossContext, LossOutput, Objective, RelaxedInputs, ScoringModel};

/// Model whose embedding table is the identity, so mixed embeddings equal probabilities.
pub struct MockModel {
    name: String,
    table: Tensor,
    vocab: usize,
    scale: f64,
    max_sequence_length: Option<usize>,
}

impl MockModel {
    /// # Errors
    /// Returns an error if the table cannot be allocated.
    pub fn identity(name: &str, vocab: usize, device: &Device) -> Result<Self> {
        let mut values = vec![0f32; vocab * vocab];
        for i in 0..vocab {
            values[i * vocab + i] = 1.0;
        }
        Ok(Self {
            name: name.to_string(),
            table: Tensor::from_vec(values, (vocab, vocab), device)?,
            vocab,
            scale: 1.0,
            max_sequence_length: None,
        })
    }

    #[must_use]
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Report a bounded context, as a positional-embedding model would.
    #[must_use]
    pub fn with_max_sequence_length(mut self, length: usize) -> Self {
        self.max_sequence_length = Some(length);
        self
    }
}

impl ScoringModel for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn embedding_table(&self) -> &Tensor {
        &self.table
    }

    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn embedding_scale(&self) -> f64 {
        self.scale
    }

    fn max_sequence_length(&self) -> Option<usize> {
        self.max_sequence_length
    }
}

/// Number of positions not holding `target`; relaxed form `length − Σ p(target)`.
pub struct TargetTokenLoss {
    model: Arc<MockModel>,
    target: u32,
}

impl TargetTokenLoss {
    #[must_use]
    pub fn new(model: Arc<MockModel>, target: u32) -> Self {
        Self { model, target }
    }
}

impl Objective for TargetTokenLoss {
    fn name(&self) -> &str {
        "target_token"
    }

    fn model(&self) -> &dyn ScoringModel {
        &*self.model
    }

    #[allow(clippy::cast_precision_loss)]
    fn compute_gold_loss(
        &self,
        _ctx: &LossContext,
        predicted: &[u32],
        _label: usize,
    ) -> Result<(f64, LossOutput)> {
        let misses = predicted.iter().filter(|&&id| id != self.target).count();
        Ok((misses as f64, LossOutput::default()))
    }

    #[allow(clippy::cast_precision_loss)]
    fn compute_loss(
        &self,
        _ctx: &LossContext,
        relaxed: &RelaxedInputs<'_>,
        _label: usize,
        _embed_scale: f64,
    ) -> Result<(Tensor, LossOutput)> {
        let (_, length, _) = relaxed.embeddings.dims3()?;
        let hits = relaxed
            .embeddings
            .narrow(D::Minus1, self.target as usize, 1)?
            .squeeze(D::Minus1)?
            .to_dtype(DType::F32)?
            .sum(1)?;
        Ok((hits.affine(-1.0, length as f64)?, LossOutput::default()))
    }
}

/// Constant loss, connected to the graph with zero gradient.
pub struct FixedLoss {
    model: Arc<MockModel>,
    value: f64,
}

impl FixedLoss {
    #[must_use]
    pub fn new(model: Arc<MockModel>, value: f64) -> Self {
        Self { model, value }
    }
}

impl Objective for FixedLoss {
    fn name(&self) -> &str {
        "fixed"
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
        Ok((self.value, LossOutput::default()))
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
            .affine(0.0, self.value)?;
        Ok((loss, LossOutput::default()))
    }
}

/// Generator that always returns the same continuation and counts its calls.
pub struct MockGenerator {
    output: Vec<u32>,
    calls: Cell<usize>,
}

impl MockGenerator {
    #[must_use]
    pub fn new(output: Vec<u32>) -> Self {
        Self {
            output,
            calls: Cell::new(0),
        }
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl super::BaselineGenerator for MockGenerator {
    fn generate(&self, _input: &[u32], max_length: usize, _num_beams: usize) -> Result<Vec<u32>> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.output.iter().copied().take(max_length).collect())
    }
}

/// Tokenizer over `vocab` ids where id `i` decodes to the letter `'a' + i`.
pub struct LetterTokenizer {
    vocab: usize,
    eos: u32,
}

impl LetterTokenizer {
    #[must_use]
    pub fn new(vocab: usize, eos: u32) -> Self {
        Self { vocab, eos }
    }
}

impl super::TextTokenizer for LetterTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.encode_plain(text)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_plain(&self, text: &str) -> Vec<u32> {
        text.chars()
            .filter(char::is_ascii_lowercase)
            .map(|c| u32::from(c) - u32::from('a'))
            .filter(|&id| (id as usize) < self.vocab)
            .collect()
    }

    fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter(|&&id| id != self.eos)
            .filter_map(|&id| char::from_u32(u32::from('a') + id))
            .collect()
    }

    fn eos_id(&self) -> u32 {
        self.eos
    }

    fn vocab_size(&self) -> usize {
        self.vocab
    }
}
