pub mod attention;
pub mod config;
pub mod embedding;
pub mod generate;
pub mod layers;
pub mod transformer;

pub use attention::{CausalSelfAttention, create_causal_mask};
pub use config::ModelConfig;
pub use embedding::{PositionalEncoding2D, TokenEmbedding, layout_positions};
pub use layers::{LayerNorm, MLP, TransformerBlock};
pub use transformer::CharLm;
