//! Turning a validated plan into loaded models and objective slots.

use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Device;

use crate::config::DecodePlan;
use crate::decode::ObjectiveSlot;
use crate::model::CharLm;
use crate::scoring::{FluencyLoss, ModelRegistry, Objective, StyleLoss, check_vocabularies};
use crate::tokenizer::CharTokenizer;
use crate::weights::{load_char_lm, probe_vocab_size};

/// Loss names understood by [`build_objectives`].
pub const KNOWN_LOSSES: [&str; 2] = ["fluency", "style"];

/// Objectives in plan order plus the primary model, which also generates baselines.
pub struct LoadedObjectives {
    pub slots: Vec<ObjectiveSlot>,
    pub primary: Arc<CharLm>,
}

/// Reject unknown loss names before anything is loaded.
///
/// # Errors
/// Returns an error naming the first unknown loss.
pub fn check_loss_names(plan: &DecodePlan) -> Result<()> {
    for spec in &plan.objectives {
        if !KNOWN_LOSSES.contains(&spec.loss.as_str()) {
            anyhow::bail!(
                "unknown loss {:?}; expected one of {}",
                spec.loss,
                KNOWN_LOSSES.join(", ")
            );
        }
    }
    Ok(())
}

/// Compare vocabularies from the weight headers, without loading any weights.
///
/// # Errors
/// Returns an error if a header is unreadable or the vocabularies differ
/// without `allow_diff_vocab`.
pub fn probe_vocabularies(plan: &DecodePlan) -> Result<usize> {
    let mut sizes = Vec::with_capacity(plan.objectives.len());
    for spec in &plan.objectives {
        let name = spec.model.display().to_string();
        let vocab = probe_vocab_size(&spec.model)?;
        sizes.push((name, vocab));
    }
    let pairs: Vec<(&str, usize)> = sizes.iter().map(|(n, v)| (n.as_str(), *v)).collect();
    Ok(check_vocabularies(&pairs, plan.allow_diff_vocab)?)
}

/// Load every model once and build one objective per plan entry.
///
/// # Errors
/// Returns an error if a model fails to load, a loss name is unknown, or a
/// style label is out of range.
pub fn build_objectives(plan: &DecodePlan, device: &Device) -> Result<LoadedObjectives> {
    check_loss_names(plan)?;
    let dtype = plan.precision.dtype();
    let mut registry = ModelRegistry::new();
    let models = plan
        .objectives
        .iter()
        .map(|spec| {
            let key = spec.model.display().to_string();
            registry.get_or_load(&key, || load_char_lm(&spec.model, device, dtype))
        })
        .collect::<Result<Vec<_>>>()?;
    tracing::info!(
        objectives = plan.objectives.len(),
        models = registry.len(),
        "scoring models ready"
    );
    from_models(plan, &models)
}

/// Build objective slots over already-constructed models, one per plan entry.
///
/// # Errors
/// Returns an error if the counts differ, a loss name is unknown, or a style
/// label is out of range.
pub fn from_models(plan: &DecodePlan, models: &[Arc<CharLm>]) -> Result<LoadedObjectives> {
    let primary = models.first().context("no scoring models")?;
    if models.len() != plan.objectives.len() {
        anyhow::bail!(
            "{} objectives but {} models",
            plan.objectives.len(),
            models.len()
        );
    }
    let tokenizer = CharTokenizer::new();
    let mut slots = Vec::with_capacity(models.len());
    for (spec, model) in plan.objectives.iter().zip(models) {
        let objective: Arc<dyn Objective> = match spec.loss.as_str() {
            "fluency" => Arc::new(FluencyLoss::new(Arc::clone(model))),
            "style" => {
                let prompts = tokenizer
                    .style_ids()
                    .iter()
                    .map(|&id| tokenizer.style_prompt(id))
                    .collect();
                let style = StyleLoss::new(Arc::clone(model), prompts)
                    .context("build style classifier")?;
                if spec.label_id >= style.num_styles() {
                    anyhow::bail!(
                        "label {} for {:?} is out of range for {} styles",
                        spec.label_id,
                        spec.abbr,
                        style.num_styles()
                    );
                }
                Arc::new(style)
            }
            other => anyhow::bail!("unknown loss {other:?}"),
        };
        slots.push(ObjectiveSlot::new(spec.abbr.clone(), objective, spec.label_id));
    }
    Ok(LoadedObjectives {
        slots,
        primary: Arc::clone(primary),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecodeConfig;
    use crate::model::ModelConfig;

    fn plan(losses: &[&str], label_ids: Vec<usize>) -> DecodePlan {
        DecodeConfig {
            losses: losses.iter().map(|s| (*s).to_string()).collect(),
            models: losses.iter().map(|_| "shared.safetensors".into()).collect(),
            epsilons: vec![1.0; losses.len() - 1],
            label_ids,
            ..DecodeConfig::default()
        }
        .validate()
        .unwrap()
    }

    fn model() -> Arc<CharLm> {
        Arc::new(CharLm::random("shared", ModelConfig::tiny(), &Device::Cpu).unwrap())
    }

    #[test]
    fn test_slots_follow_plan_order() {
        let plan = plan(&["fluency", "style"], vec![0, 2]);
        let m = model();
        let loaded = from_models(&plan, &[Arc::clone(&m), m]).unwrap();
        assert_eq!(loaded.slots.len(), 2);
        assert_eq!(loaded.slots[0].objective.name(), "fluency");
        assert_eq!(loaded.slots[1].objective.name(), "style");
        assert_eq!(loaded.slots[1].label_id, 2);
        assert_eq!(loaded.slots[1].abbr, "style");
    }

    #[test]
    fn test_style_label_out_of_range() {
        let plan = plan(&["fluency", "style"], vec![0, 4]);
        let m = model();
        assert!(from_models(&plan, &[Arc::clone(&m), m]).is_err());
    }

    #[test]
    fn test_unknown_loss_rejected_before_loading() {
        let plan = plan(&["fluency", "toxicity"], vec![0, 0]);
        let err = check_loss_names(&plan).unwrap_err();
        assert!(err.to_string().contains("toxicity"));
        // Nothing on disk is touched.
        assert!(build_objectives(&plan, &Device::Cpu).is_err());
    }

    #[test]
    fn test_model_count_must_match() {
        let plan = plan(&["fluency", "style"], vec![0, 0]);
        assert!(from_models(&plan, &[model()]).is_err());
        assert!(from_models(&plan, &[]).is_err());
    }
}
