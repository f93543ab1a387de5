pub mod relaxed;
pub mod sampling;

pub use relaxed::{
    EmbeddingTable, RelaxedOutput, RelaxedTarget, TargetInit, TargetKind, TargetSettings,
    mix_embeddings, one_hot,
};
pub use sampling::{SamplingStrategy, filter_top_k, filter_top_p, sample_row};
