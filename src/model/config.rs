use serde::{Deserialize, Serialize};

/// Hyperparameters of the character-level LM, read from `config.json`
/// next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Maximum sequence length, context and optimized tokens together
    pub block_size: usize,
    /// Vocabulary size (12 special + 95 printable ASCII)
    pub vocab_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    /// Row positions beyond this are clamped to the last row embedding
    pub max_rows: usize,
    /// Column positions beyond this are clamped to the last column embedding
    pub max_cols: usize,
    /// Token that advances the row position
    pub newline_token_id: u32,
    pub pad_token_id: u32,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
}

impl ModelConfig {
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Validate that configuration is consistent.
    ///
    /// # Errors
    /// Returns an error if the configuration is internally inconsistent.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.n_head == 0 || !self.n_embd.is_multiple_of(self.n_head) {
            return Err("n_embd must be a positive multiple of n_head");
        }
        if self.vocab_size == 0 {
            return Err("vocab_size must be positive");
        }
        if self.block_size == 0 {
            return Err("block_size must be positive");
        }
        if self.max_rows == 0 || self.max_cols == 0 {
            return Err("max_rows and max_cols must be positive");
        }
        Ok(())
    }

    /// One-layer config for tests and smoke runs with random weights.
    #[must_use]
    pub fn tiny() -> Self {
        Self {
            block_size: 128,
            n_layer: 1,
            n_head: 2,
            n_embd: 32,
            max_rows: 16,
            max_cols: 128,
            ..Self::small()
        }
    }

    /// ~10M parameters.
    #[must_use]
    pub fn small() -> Self {
        Self {
            block_size: 1024,
            vocab_size: 107,
            n_layer: 4,
            n_head: 4,
            n_embd: 256,
            max_rows: 100,
            max_cols: 200,
            newline_token_id: 7,
            pad_token_id: 0,
            bos_token_id: 1,
            eos_token_id: 2,
        }
    }

    /// ~20M parameters.
    #[must_use]
    pub fn medium() -> Self {
        Self {
            block_size: 2048,
            n_layer: 6,
            n_head: 6,
            n_embd: 384,
            ..Self::small()
        }
    }

    /// ~30M parameters.
    #[must_use]
    pub fn large() -> Self {
        Self {
            block_size: 4096,
            n_layer: 8,
            n_head: 8,
            n_embd: 512,
            ..Self::small()
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::medium()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for config in [
            ModelConfig::tiny(),
            ModelConfig::small(),
            ModelConfig::medium(),
            ModelConfig::large(),
        ] {
            assert!(config.validate().is_ok(), "{config:?}");
            assert_eq!(config.vocab_size, 107);
        }
    }

    #[test]
    fn test_rejects_bad_head_split() {
        let config = ModelConfig {
            n_embd: 100,
            n_head: 3,
            ..ModelConfig::tiny()
        };
        assert!(config.validate().is_err());
        let config = ModelConfig {
            n_head: 0,
            ..ModelConfig::tiny()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_keeps_fields() {
        let json = serde_json::to_string(&ModelConfig::tiny()).unwrap();
        let parsed: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ModelConfig::tiny());
    }
}
