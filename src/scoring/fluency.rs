//! Fluency: expected negative log-likelihood under the character LM.

use std::sync::Arc;

use candle_core::{DType, Result, Tensor};

use super::{LossContext, LossOutput, Objective, RelaxedInputs, ScoringModel, gold_loss_via_one_hot};
use crate::model::CharLm;

/// Summed expected NLL of the relaxed continuation given source and prefix.
pub struct FluencyLoss {
    model: Arc<CharLm>,
}

impl FluencyLoss {
    #[must_use]
    pub fn new(model: Arc<CharLm>) -> Self {
        Self { model }
    }
}

/// Keep the most recent context tokens that fit before `length` new ones.
pub(crate) fn crop_context(context: &[u32], length: usize, block_size: usize) -> &[u32] {
    let room = block_size.saturating_sub(length).max(1);
    &context[context.len().saturating_sub(room)..]
}

impl Objective for FluencyLoss {
    fn name(&self) -> &str {
        "fluency"
    }

    fn model(&self) -> &dyn ScoringModel {
        &*self.model
    }

    fn compute_gold_loss(
        &self,
        ctx: &LossContext,
        predicted: &[u32],
        label: usize,
    ) -> Result<(f64, LossOutput)> {
        if predicted.is_empty() {
            return Ok((0.0, LossOutput::default()));
        }
        gold_loss_via_one_hot(self, ctx, predicted, label)
    }

    fn compute_loss(
        &self,
        ctx: &LossContext,
        relaxed: &RelaxedInputs<'_>,
        _label: usize,
        _embed_scale: f64,
    ) -> Result<(Tensor, LossOutput)> {
        let (_, length) = relaxed.tokens.dims2()?;
        let conditioning = ctx.conditioning();
        let context = crop_context(&conditioning, length, self.model.config().block_size);

        let (loss, per_position) =
            self.model
                .expected_nll(context, relaxed.tokens, relaxed.embeddings, relaxed.probs)?;
        let first = per_position.narrow(0, 0, 1)?.squeeze(0)?.to_dtype(DType::F32)?;
        let token_logprobs = first.neg()?.to_vec1::<f32>()?;
        Ok((
            loss,
            LossOutput {
                predicted_label: None,
                token_logprobs: Some(token_logprobs),
            },
        ))
    }
}
