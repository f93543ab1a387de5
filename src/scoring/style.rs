//! Style constraint from a generative classifier.
//!
//! Each style has a prompt (e.g. `<BOS> <STYLE> <SEP>`); the continuation's
//! NLL under every prompt gives a class score `-nll`, and the loss is the
//! cross-entropy of the configured label under the softmax of those scores.

use std::sync::Arc;

use candle_core::{D, DType, Result, Tensor};

use super::fluency::crop_context;
use super::{LossContext, LossOutput, Objective, RelaxedInputs, ScoringModel, gold_loss_via_one_hot};
use crate::model::CharLm;

pub struct StyleLoss {
    model: Arc<CharLm>,
    prompts: Vec<Vec<u32>>,
}

impl StyleLoss {
    /// One prompt per style label, in label order.
    ///
    /// # Errors
    /// Returns an error if no prompt is given or any prompt is empty.
    pub fn new(model: Arc<CharLm>, prompts: Vec<Vec<u32>>) -> Result<Self> {
        if prompts.is_empty() || prompts.iter().any(Vec::is_empty) {
            candle_core::bail!("style classifier needs one non-empty prompt per style");
        }
        Ok(Self { model, prompts })
    }

    #[must_use]
    pub fn num_styles(&self) -> usize {
        self.prompts.len()
    }

    /// `(batch, styles)` NLL of the continuation under every style prompt.
    fn style_nll(&self, relaxed: &RelaxedInputs<'_>) -> Result<Tensor> {
        let (_, length) = relaxed.tokens.dims2()?;
        let block = self.model.config().block_size;
        let per_style = self
            .prompts
            .iter()
            .map(|prompt| {
                let context = crop_context(prompt, length, block);
                self.model
                    .expected_nll(context, relaxed.tokens, relaxed.embeddings, relaxed.probs)
                    .map(|(loss, _)| loss)
            })
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&per_style, 1)?.to_dtype(DType::F32)
    }
}

impl Objective for StyleLoss {
    fn name(&self) -> &str {
        "style"
    }

    fn model(&self) -> &dyn ScoringModel {
        &*self.model
    }

    #[allow(clippy::cast_precision_loss)]
    fn compute_gold_loss(
        &self,
        ctx: &LossContext,
        predicted: &[u32],
        label: usize,
    ) -> Result<(f64, LossOutput)> {
        if predicted.is_empty() {
            // No evidence: uniform over styles.
            return Ok(((self.num_styles() as f64).ln(), LossOutput::default()));
        }
        gold_loss_via_one_hot(self, ctx, predicted, label)
    }

    fn compute_loss(
        &self,
        _ctx: &LossContext,
        relaxed: &RelaxedInputs<'_>,
        label: usize,
        _embed_scale: f64,
    ) -> Result<(Tensor, LossOutput)> {
        if label >= self.num_styles() {
            candle_core::bail!(
                "style label {label} out of range for {} styles",
                self.num_styles()
            );
        }
        let nll = self.style_nll(relaxed)?;
        let log_probs = candle_nn::ops::log_softmax(&nll.neg()?, D::Minus1)?;
        let loss = log_probs.narrow(1, label, 1)?.squeeze(1)?.neg()?;

        let first = nll.narrow(0, 0, 1)?.squeeze(0)?.to_vec1::<f32>()?;
        let predicted_label = first
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i);
        Ok((
            loss,
            LossOutput {
                predicted_label,
                token_logprobs: None,
            },
        ))
    }
}
