//! Autoregressive baseline: greedy for one beam, plain beam search otherwise.

use std::cmp::Ordering;

use candle_core::{D, DType, Result, Tensor};

use super::transformer::CharLm;
use crate::scoring::BaselineGenerator;

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    score: f32,
    finished: bool,
}

impl CharLm {
    /// Log-probabilities of the next token after `ids`, cropped to `block_size`.
    fn next_log_probs(&self, ids: &[u32]) -> Result<Vec<f32>> {
        let block = self.config().block_size;
        let window = &ids[ids.len().saturating_sub(block)..];
        let input = Tensor::new(window, self.device())?.unsqueeze(0)?;
        let logits = self.forward_last(&input)?.to_dtype(DType::F32)?;
        candle_nn::ops::log_softmax(&logits, D::Minus1)?
            .squeeze(0)?
            .to_vec1::<f32>()
    }
}

fn by_score_desc(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

impl BaselineGenerator for CharLm {
    #[allow(clippy::cast_possible_truncation)]
    fn generate(&self, input: &[u32], max_length: usize, num_beams: usize) -> Result<Vec<u32>> {
        if input.is_empty() {
            candle_core::bail!("generation needs a non-empty prompt");
        }
        let width = num_beams.max(1);
        let eos = self.config().eos_token_id;
        let mut beams = vec![Beam {
            tokens: Vec::new(),
            score: 0.0,
            finished: false,
        }];

        for _ in 0..max_length {
            if beams.iter().all(|beam| beam.finished) {
                break;
            }
            let mut expanded = Vec::with_capacity(beams.len() * width);
            for beam in &beams {
                if beam.finished {
                    expanded.push(beam.clone());
                    continue;
                }
                let context: Vec<u32> = input.iter().chain(&beam.tokens).copied().collect();
                let log_probs = self.next_log_probs(&context)?;

                let mut order: Vec<usize> = (0..log_probs.len()).collect();
                order.sort_by(|&a, &b| by_score_desc(log_probs[a], log_probs[b]));
                for &id in order.iter().take(width) {
                    let mut tokens = beam.tokens.clone();
                    tokens.push(id as u32);
                    expanded.push(Beam {
                        tokens,
                        score: beam.score + log_probs[id],
                        finished: id as u32 == eos,
                    });
                }
            }
            expanded.sort_by(|a, b| by_score_desc(a.score, b.score));
            expanded.truncate(width);
            beams = expanded;
        }

        Ok(beams.into_iter().next().map(|beam| beam.tokens).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::model::ModelConfig;

    fn tiny() -> CharLm {
        CharLm::random("tiny", ModelConfig::tiny(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_greedy_respects_max_length_and_is_deterministic() {
        let model = tiny();
        let prompt = [1u32, 40, 41, 4];
        let first = model.generate(&prompt, 6, 1).unwrap();
        assert!(first.len() <= 6);
        assert!(!first.is_empty());
        assert_eq!(model.generate(&prompt, 6, 1).unwrap(), first);
    }

    #[test]
    fn test_greedy_follows_argmax() {
        let model = tiny();
        let prompt = [1u32, 4];
        let out = model.generate(&prompt, 1, 1).unwrap();
        let logits = model
            .forward_last(&Tensor::new(vec![prompt.to_vec()], model.device()).unwrap())
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(out, vec![crate::target::sampling::argmax(&logits)]);
    }

    #[test]
    fn test_beam_search_stays_within_budget() {
        let model = tiny();
        let prompt = [1u32, 50, 4];
        let beam = model.generate(&prompt, 3, 4).unwrap();
        assert!(!beam.is_empty() && beam.len() <= 3);
        assert!(beam.iter().all(|&id| (id as usize) < model.config().vocab_size));
        assert_eq!(model.generate(&prompt, 3, 4).unwrap(), beam);
    }

    #[test]
    fn test_zero_length_generates_nothing() {
        let model = tiny();
        assert!(model.generate(&[1, 4], 0, 3).unwrap().is_empty());
    }
}
