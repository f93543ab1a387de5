use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use safetensors::tensor::Metadata;

use crate::model::{CharLm, ModelConfig};

/// Tensor whose first dimension is the vocabulary size.
const EMBEDDING_TENSOR: &str = "token_embedding.weight";

/// Headers larger than this are rejected before allocation.
const MAX_HEADER_BYTES: u64 = 100 * 1024 * 1024;

/// Load a character LM from a safetensors file, reading `config.json` from
/// the same directory when present.
///
/// The model is named after `path` so objectives sharing a file share it.
///
/// # Errors
/// Returns an error if the config or weights cannot be read or do not match.
pub fn load_char_lm(path: &Path, device: &Device, dtype: DType) -> Result<CharLm> {
    let config = load_model_config(path)?;
    let data = std::fs::read(path).with_context(|| format!("read weights {}", path.display()))?;
    let vb = VarBuilder::from_buffered_safetensors(data, dtype, device)
        .with_context(|| format!("parse safetensors {}", path.display()))?;
    let name = path.display().to_string();
    let model = CharLm::new(&name, config, vb).with_context(|| format!("build model from {name}"))?;
    tracing::info!(
        model = %name,
        vocab = model.config().vocab_size,
        layers = model.config().n_layer,
        ?dtype,
        "loaded scoring model"
    );
    Ok(model)
}

/// `config.json` next to `weights_path`, or the default config when absent.
///
/// # Errors
/// Returns an error if the file exists but cannot be parsed or is inconsistent.
pub fn load_model_config(weights_path: &Path) -> Result<ModelConfig> {
    let Some(parent) = weights_path.parent() else {
        return Ok(ModelConfig::default());
    };
    let config_path = parent.join("config.json");
    if !config_path.exists() {
        tracing::warn!(
            path = %config_path.display(),
            "no config.json next to the weights; using the default model config"
        );
        return Ok(ModelConfig::default());
    }

    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("read config {}", config_path.display()))?;
    let config: ModelConfig =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", config_path.display()))?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid ModelConfig")?;
    Ok(config)
}

/// Vocabulary size from the safetensors header alone, without reading weights.
///
/// # Errors
/// Returns an error if the header is unreadable or lacks the embedding tensor.
pub fn probe_vocab_size(path: &Path) -> Result<usize> {
    let mut file = File::open(path).with_context(|| format!("open weights {}", path.display()))?;
    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)
        .with_context(|| format!("read safetensors header length of {}", path.display()))?;
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > MAX_HEADER_BYTES {
        anyhow::bail!("safetensors header of {} is {header_len} bytes", path.display());
    }

    let mut header = Vec::new();
    file.take(header_len)
        .read_to_end(&mut header)
        .with_context(|| format!("read safetensors header of {}", path.display()))?;
    let metadata: Metadata = serde_json::from_slice(&header)
        .with_context(|| format!("parse safetensors header of {}", path.display()))?;
    let tensors = metadata.tensors();
    let info = tensors
        .get(EMBEDDING_TENSOR)
        .with_context(|| format!("{} has no {EMBEDDING_TENSOR}", path.display()))?;
    info.shape
        .first()
        .copied()
        .with_context(|| format!("{EMBEDDING_TENSOR} in {} is a scalar", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_model(dir: &Path, config: &ModelConfig) -> std::path::PathBuf {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        CharLm::new("init", config.clone(), vb).unwrap();
        let path = dir.join("model.safetensors");
        varmap.save(&path).unwrap();
        std::fs::write(dir.join("config.json"), serde_json::to_string(config).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_vocab_size_read_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(dir.path(), &ModelConfig::tiny());
        assert_eq!(probe_vocab_size(&path).unwrap(), ModelConfig::tiny().vocab_size);
    }

    #[test]
    fn test_load_round_trips_config_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(dir.path(), &ModelConfig::tiny());
        let model = load_char_lm(&path, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(model.config(), &ModelConfig::tiny());
        assert_eq!(model.dtype(), DType::F32);
    }

    #[test]
    fn test_missing_or_invalid_files_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.safetensors");
        assert!(probe_vocab_size(&missing).is_err());
        assert!(load_char_lm(&missing, &Device::Cpu, DType::F32).is_err());

        let garbage = dir.path().join("garbage.safetensors");
        std::fs::write(&garbage, b"not a safetensors file").unwrap();
        assert!(probe_vocab_size(&garbage).is_err());
    }

    #[test]
    fn test_inconsistent_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let bad = ModelConfig {
            n_head: 3,
            ..ModelConfig::tiny()
        };
        let json = serde_json::to_string(&bad).unwrap();
        std::fs::write(dir.path().join("config.json"), json).unwrap();
        assert!(load_model_config(&path).is_err());
    }
}
