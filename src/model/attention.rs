//! Multi-head causal self-attention.
//!
//! Only ops with backward support are used, so gradients reach soft input
//! embeddings.

use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use super::config::ModelConfig;

pub struct CausalSelfAttention {
    /// Combined query, key, value projection (n_embd -> 3 * n_embd)
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    n_embd: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;
        Ok(Self {
            c_attn: candle_nn::linear_no_bias(n_embd, 3 * n_embd, vb.pp("c_attn"))?,
            c_proj: candle_nn::linear_no_bias(n_embd, n_embd, vb.pp("c_proj"))?,
            n_head: config.n_head,
            n_embd,
            head_dim: config.head_dim(),
        })
    }

    fn split_heads(&self, x: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        x.reshape((b, t, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `(batch, seq_len, n_embd)` in and out; `mask` from [`create_causal_mask`].
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let qkv = self.c_attn.forward(x)?;

        let q = self.split_heads(&qkv.narrow(D::Minus1, 0, self.n_embd)?, b, t)?;
        let k = self.split_heads(&qkv.narrow(D::Minus1, self.n_embd, self.n_embd)?, b, t)?;
        let v = self.split_heads(&qkv.narrow(D::Minus1, 2 * self.n_embd, self.n_embd)?, b, t)?;

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q
            .matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?
            .affine(scale, 0.0)?
            .broadcast_add(&mask.to_dtype(x.dtype())?)?;

        // Softmax in f32; the fused last-dim kernel has no backward pass.
        let att = candle_nn::ops::softmax(&scores.to_dtype(DType::F32)?, D::Minus1)?
            .to_dtype(x.dtype())?;

        let y = att
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.n_embd))?;
        self.c_proj.forward(&y)
    }
}

/// `(1, 1, T, T)` mask: 0 where `j <= i`, `-inf` above the diagonal.
///
/// # Errors
/// Returns an error if tensor creation fails.
pub fn create_causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Tensor::from_vec(values, (seq_len, seq_len), device)?
        .unsqueeze(0)?
        .unsqueeze(0)
}
