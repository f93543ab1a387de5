//! Decoder-only character LM used as scoring model and baseline generator.

use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use super::attention::create_causal_mask;
use super::config::ModelConfig;
use super::embedding::{PositionalEncoding2D, TokenEmbedding};
use super::layers::{LayerNorm, TransformerBlock};
use crate::scoring::ScoringModel;

/// Character-level GPT with 2D positions and a tied LM head.
pub struct CharLm {
    name: String,
    token_embedding: TokenEmbedding,
    pos_encoding: PositionalEncoding2D,
    blocks: Vec<TransformerBlock>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: ModelConfig,
    device: Device,
}

impl CharLm {
    /// Build the model from `vb`; `name` identifies it among scoring models.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(name: &str, config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let token_embedding = TokenEmbedding::new(&config, vb.pp("token_embedding"))?;
        // Nested as pos_encoding.pos_encoding.{row,col}_embedding in exported weights.
        let pos_encoding =
            PositionalEncoding2D::new(&config, vb.pp("pos_encoding").pp("pos_encoding"))?;
        let blocks = (0..config.n_layer)
            .map(|i| TransformerBlock::new(&config, vb.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = LayerNorm::new(config.n_embd, 1e-5, vb.pp("ln_f"))?;

        let lm_head = if vb.pp("lm_head").contains_tensor("weight") {
            candle_nn::linear_no_bias(config.n_embd, config.vocab_size, vb.pp("lm_head"))?
        } else {
            Linear::new(token_embedding.weights().clone(), None)
        };

        Ok(Self {
            name: name.to_string(),
            token_embedding,
            pos_encoding,
            blocks,
            ln_f,
            lm_head,
            device: vb.device().clone(),
            config,
        })
    }

    /// Random-weight model, for tests and smoke runs.
    ///
    /// # Errors
    /// Returns an error if the config is invalid.
    pub fn random(name: &str, config: ModelConfig, device: &Device) -> Result<Self> {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Self::new(name, config, vb)
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Dtype of the model weights.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.token_embedding.weights().dtype()
    }

    /// `(batch, seq_len)` ids to input embeddings.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.token_embedding.forward(input_ids)
    }

    /// Logits `(batch, seq_len, vocab)` for discrete ids.
    ///
    /// # Errors
    /// Returns an error if the sequence exceeds `block_size` or a tensor op fails.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.forward_embeds(&self.embed(input_ids)?, input_ids)
    }

    /// Logits for arbitrary input embeddings.
    ///
    /// `layout_ids` has the same `(batch, seq_len)` shape and only decides
    /// the 2D positions, so gradients flow into `embeds` alone.
    ///
    /// # Errors
    /// Returns an error if shapes disagree, the sequence exceeds `block_size`,
    /// or a tensor op fails.
    pub fn forward_embeds(&self, embeds: &Tensor, layout_ids: &Tensor) -> Result<Tensor> {
        let (b, t, _) = embeds.dims3()?;
        if layout_ids.dims2()? != (b, t) {
            candle_core::bail!(
                "layout {:?} does not match embeddings ({b}, {t})",
                layout_ids.dims()
            );
        }
        if t > self.config.block_size {
            candle_core::bail!(
                "sequence length {t} exceeds block_size {}",
                self.config.block_size
            );
        }

        let pos = self.pos_encoding.forward(layout_ids)?;
        let mut x = embeds.to_dtype(self.dtype())?.add(&pos)?;
        let mask = create_causal_mask(t, &self.device)?;
        for block in &self.blocks {
            x = block.forward(&x, &mask)?;
        }
        self.lm_head.forward(&self.ln_f.forward(&x)?)
    }

    /// Logits `(batch, vocab)` at the last position.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward_last(&self, input_ids: &Tensor) -> Result<Tensor> {
        let logits = self.forward(input_ids)?;
        let (_, t, _) = logits.dims3()?;
        logits.narrow(1, t - 1, 1)?.squeeze(1)
    }

    /// Expected negative log-likelihood of a relaxed continuation of `context`.
    ///
    /// `tokens`, `embeds` and `probs` describe the continuation as
    /// `(batch, len)`, `(batch, len, n_embd)` and `(batch, len, vocab)`.
    /// Returns the per-example loss `(batch,)` and per-position NLL `(batch, len)`.
    ///
    /// # Errors
    /// Returns an error for an empty context or a failed tensor op.
    pub fn expected_nll(
        &self,
        context: &[u32],
        tokens: &Tensor,
        embeds: &Tensor,
        probs: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        if context.is_empty() {
            candle_core::bail!("expected_nll needs at least one context token");
        }
        let (b, len, vocab) = probs.dims3()?;
        let ctx_len = context.len();

        let ctx_ids = Tensor::new(context, &self.device)?
            .unsqueeze(0)?
            .repeat((b, 1))?;
        let ctx_emb = self.embed(&ctx_ids)?;
        let inputs = Tensor::cat(&[&ctx_emb, &embeds.to_dtype(ctx_emb.dtype())?], 1)?;
        let layout = Tensor::cat(&[&ctx_ids, &tokens.to_dtype(DType::U32)?], 1)?;

        let logits = self.forward_embeds(&inputs, &layout)?;
        // Position ctx_len - 1 + i predicts continuation token i.
        let log_probs = candle_nn::ops::log_softmax(
            &logits.narrow(1, ctx_len - 1, len)?.to_dtype(DType::F32)?,
            D::Minus1,
        )?;

        let shared = vocab.min(self.config.vocab_size);
        let probs = probs.to_dtype(DType::F32)?.narrow(D::Minus1, 0, shared)?;
        let log_probs = log_probs.narrow(D::Minus1, 0, shared)?;
        let per_position = probs.mul(&log_probs)?.sum(D::Minus1)?.neg()?;
        Ok((per_position.sum(1)?, per_position))
    }
}

impl ScoringModel for CharLm {
    fn name(&self) -> &str {
        &self.name
    }

    fn embedding_table(&self) -> &Tensor {
        self.token_embedding.weights()
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn max_sequence_length(&self) -> Option<usize> {
        Some(self.config.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::one_hot;

    fn tiny() -> CharLm {
        CharLm::random("tiny", ModelConfig::tiny(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_shapes_with_random_init() {
        let model = tiny();
        let input = Tensor::zeros((2, 8), DType::U32, model.device()).unwrap();
        let logits = model.forward(&input).unwrap();
        assert_eq!(logits.dims(), &[2, 8, 107]);
        assert_eq!(model.forward_last(&input).unwrap().dims(), &[2, 107]);
    }

    #[test]
    fn test_forward_rejects_overlong_input() {
        let model = tiny();
        let input = Tensor::zeros((1, 129), DType::U32, model.device()).unwrap();
        assert!(model.forward(&input).is_err());
    }

    #[test]
    fn test_forward_embeds_matches_forward_on_discrete_ids() {
        let model = tiny();
        let ids = Tensor::new(vec![vec![1u32, 40, 41, 7, 42, 4]], model.device()).unwrap();
        let direct = model.forward(&ids).unwrap();
        let via_embeds = model.forward_embeds(&model.embed(&ids).unwrap(), &ids).unwrap();
        let diff = (direct - via_embeds)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_expected_nll_on_one_hot_matches_token_nll() {
        let model = tiny();
        let context = [1u32, 30, 4];
        let continuation = vec![vec![50u32, 51]];
        let probs = one_hot(&continuation, 107, model.device()).unwrap();
        let tokens = Tensor::new(continuation.clone(), model.device()).unwrap();
        let embeds = model.embed(&tokens).unwrap();
        let (loss, per_position) = model
            .expected_nll(&context, &tokens, &embeds, &probs)
            .unwrap();
        assert_eq!(loss.dims(), &[1]);
        assert_eq!(per_position.dims(), &[1, 2]);

        let all = Tensor::new(vec![vec![1u32, 30, 4, 50, 51]], model.device()).unwrap();
        let log_probs =
            candle_nn::ops::log_softmax(&model.forward(&all).unwrap(), D::Minus1).unwrap();
        let lp = log_probs.to_vec3::<f32>().unwrap();
        let expected = -(lp[0][2][50] + lp[0][3][51]);
        let got = loss.to_vec1::<f32>().unwrap()[0];
        assert!((got - expected).abs() < 1e-4, "{got} vs {expected}");
    }

    #[test]
    fn test_expected_nll_gradient_reaches_embeddings() {
        let model = tiny();
        let tokens = Tensor::new(vec![vec![40u32, 41, 42]], model.device()).unwrap();
        let embeds =
            candle_core::Var::randn(0f32, 0.5, (1, 3, model.config().n_embd), model.device())
                .unwrap();
        let probs = one_hot(&[vec![40, 41, 42]], 107, model.device()).unwrap();
        let (loss, _) = model
            .expected_nll(&[1, 4], &tokens, embeds.as_tensor(), &probs)
            .unwrap();
        let grads = loss.sum_all().unwrap().backward().unwrap();
        let g = grads.get(embeds.as_tensor()).unwrap();
        let norm = g.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(norm.is_finite() && norm > 0.0);
    }
}
