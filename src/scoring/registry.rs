//! Setup-time sharing of loaded models.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::DecodeError;

/// Models keyed by identity (usually the weights path), each loaded once.
pub struct ModelRegistry<M> {
    models: BTreeMap<String, Arc<M>>,
}

impl<M> Default for ModelRegistry<M> {
    fn default() -> Self {
        Self {
            models: BTreeMap::new(),
        }
    }
}

impl<M> ModelRegistry<M> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the model registered under `key`, loading it first if needed.
    ///
    /// # Errors
    /// Propagates the loader's error; nothing is registered in that case.
    pub fn get_or_load<E>(
        &mut self,
        key: &str,
        load: impl FnOnce() -> Result<M, E>,
    ) -> Result<Arc<M>, E> {
        if let Some(model) = self.models.get(key) {
            tracing::debug!(model = key, "reusing loaded model");
            return Ok(Arc::clone(model));
        }
        let model = Arc::new(load()?);
        tracing::info!(model = key, "loaded model");
        self.models.insert(key.to_string(), Arc::clone(&model));
        Ok(model)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<M>> {
        self.models.get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Check that every `(name, vocab_size)` pair agrees with the first one.
///
/// Returns the primary vocabulary size. With `allow_diff_vocab` a mismatch
/// only logs a warning.
///
/// # Errors
/// Returns [`DecodeError::VocabMismatch`] on the first disagreement when the
/// override is off.
pub fn check_vocabularies(
    models: &[(&str, usize)],
    allow_diff_vocab: bool,
) -> Result<usize, DecodeError> {
    let Some(&(primary_name, primary)) = models.first() else {
        return Ok(0);
    };
    for &(name, size) in &models[1..] {
        if size == primary {
            continue;
        }
        if !allow_diff_vocab {
            return Err(DecodeError::VocabMismatch {
                primary,
                other: size,
                model: name.to_string(),
            });
        }
        tracing::warn!(
            primary_model = primary_name,
            primary_vocab = primary,
            model = name,
            vocab = size,
            "scoring models have different vocabularies; embeddings are truncated to the shared range"
        );
    }
    Ok(primary)
}
