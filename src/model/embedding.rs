//! Token embedding and learned 2D (row, column) positional encoding.

use candle_core::{D, Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

use super::config::ModelConfig;

pub struct TokenEmbedding {
    embedding: Embedding,
}

impl TokenEmbedding {
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(config.vocab_size, config.n_embd, vb)?;
        Ok(Self { embedding })
    }

    /// `(batch, seq_len)` ids to `(batch, seq_len, n_embd)`.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.embedding.forward(token_ids)
    }

    /// `(vocab, n_embd)` table; also the tied LM head.
    #[must_use]
    pub fn weights(&self) -> &Tensor {
        self.embedding.embeddings()
    }
}

/// Row and column of every position in a token layout.
///
/// The row advances after each newline and the column restarts at 0.
/// Both saturate at the last available embedding.
#[must_use]
pub fn layout_positions(
    token_ids: &[u32],
    newline_id: u32,
    max_rows: usize,
    max_cols: usize,
) -> (Vec<u32>, Vec<u32>) {
    let last_row = u32::try_from(max_rows.saturating_sub(1)).unwrap_or(u32::MAX);
    let last_col = u32::try_from(max_cols.saturating_sub(1)).unwrap_or(u32::MAX);
    let mut rows = Vec::with_capacity(token_ids.len());
    let mut cols = Vec::with_capacity(token_ids.len());
    let (mut row, mut col) = (0u32, 0u32);
    for &token in token_ids {
        rows.push(row.min(last_row));
        cols.push(col.min(last_col));
        if token == newline_id {
            row = row.saturating_add(1);
            col = 0;
        } else {
            col = col.saturating_add(1);
        }
    }
    (rows, cols)
}

/// Separate learned embeddings for row and column, concatenated.
pub struct PositionalEncoding2D {
    row_embedding: Embedding,
    col_embedding: Embedding,
    newline_token_id: u32,
    max_rows: usize,
    max_cols: usize,
}

impl PositionalEncoding2D {
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let row_dim = config.n_embd / 2;
        let col_dim = config.n_embd - row_dim;
        Ok(Self {
            row_embedding: candle_nn::embedding(config.max_rows, row_dim, vb.pp("row_embedding"))?,
            col_embedding: candle_nn::embedding(config.max_cols, col_dim, vb.pp("col_embedding"))?,
            newline_token_id: config.newline_token_id,
            max_rows: config.max_rows,
            max_cols: config.max_cols,
        })
    }

    /// Position embeddings `(batch, seq_len, n_embd)` for a discrete layout.
    ///
    /// The layout only decides positions, so relaxed inputs use their
    /// decoded ids here while their embeddings stay soft.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, layout_ids: &Tensor) -> Result<Tensor> {
        let device = layout_ids.device();
        let layout: Vec<Vec<u32>> = layout_ids.to_vec2()?;

        let (rows, cols): (Vec<Vec<u32>>, Vec<Vec<u32>>) = layout
            .iter()
            .map(|ids| layout_positions(ids, self.newline_token_id, self.max_rows, self.max_cols))
            .unzip();

        let row_emb = self.row_embedding.forward(&Tensor::new(rows, device)?)?;
        let col_emb = self.col_embedding.forward(&Tensor::new(cols, device)?)?;
        Tensor::cat(&[&row_emb, &col_emb], D::Minus1)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn test_layout_positions() {
        // "ab\ncd"
        let (rows, cols) = layout_positions(&[10, 11, 7, 12, 13], 7, 100, 200);
        assert_eq!(rows, vec![0, 0, 0, 1, 1]);
        assert_eq!(cols, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_layout_positions_saturate() {
        let (rows, cols) = layout_positions(&[7, 7, 7, 20, 20, 20], 7, 2, 2);
        assert_eq!(rows, vec![0, 1, 1, 1, 1, 1]);
        assert_eq!(cols, vec![0, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_positional_encoding_shape() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let pos = PositionalEncoding2D::new(&config, vb).unwrap();
        let layout = Tensor::new(vec![vec![20u32; 300]], &device).unwrap();
        let emb = pos.forward(&layout).unwrap();
        assert_eq!(emb.dims(), &[1, 300, config.n_embd]);
    }
}
