//! Sinusoidal Positional Encoding
//!
//! Attention is order-agnostic, so a fixed position signal is added to the
//! token embeddings:
//!
//! ```text
//! angle(pos, i) = pos / 10000^(i / embedding_dim)
//! pe[pos][i]    = sin(angle)   for even i
//!               = cos(angle)   for odd i
//! ```
//!
//! There are no parameters. The gradient of the addition is the identity, so
//! there is no backward pass.

use crate::error::Result;
use crate::tensor::Tensor;

/// Fixed sinusoidal position signal
#[derive(Clone, Copy, Debug)]
pub struct PositionalEncoding {
    embedding_dim: usize,
}

impl PositionalEncoding {
    pub fn new(embedding_dim: usize) -> Self {
        Self { embedding_dim }
    }

    /// Position signal of the same shape as `embeddings`.
    pub fn forward(&self, embeddings: &Tensor) -> Result<Tensor> {
        embeddings.ensure_width(self.embedding_dim, "positional encoding input")?;
        let seq_len = embeddings.rows();
        let dim = self.embedding_dim as f32;

        let mut pe = Tensor::zeros(seq_len, self.embedding_dim);
        for pos in 0..seq_len {
            for (i, v) in pe.row_mut(pos).iter_mut().enumerate() {
                let angle = pos as f32 / 10000f32.powf(i as f32 / dim);
                *v = if i % 2 == 0 { angle.sin() } else { angle.cos() };
            }
        }
        Ok(pe)
    }

    /// `embeddings + forward(embeddings)`
    pub fn apply(&self, embeddings: &Tensor) -> Result<Tensor> {
        embeddings.add(&self.forward(embeddings)?)
    }
}
