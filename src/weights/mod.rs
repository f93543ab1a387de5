pub mod loader;

pub use loader::{load_char_lm, load_model_config, probe_vocab_size};
