//! Add & Norm
//!
//! Residual connection followed by layer normalization, applied after every
//! sub-block of the encoder and decoder (post-norm):
//!
//! ```text
//! 1. add  = input + residual
//! 2. mean = sum(add) / N                       (per row)
//! 3. std  = √(sum((add - mean)²) / N)          (population)
//! 4. norm = (add - mean) / (std + ε)
//! 5. y    = γ * norm + β
//! ```
//!
//! Note that ε is added to the standard deviation, not the variance.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ = sum_rows(grad_y * norm)
//! grad_β = sum_rows(grad_y)
//! g      = grad_y * γ
//! grad_add = (g - mean(g) - norm * mean(g * norm)) / (std + ε)
//! ```
//!
//! The gradient of the addition is the identity, so `grad_add` is the
//! gradient for both the input and the residual branch.

use super::Parameters;
use crate::error::{Result, ViolaError};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Residual add followed by layer normalization
pub struct AddNorm {
    pub gamma: Tensor, // Scale parameter [embedding_dim]
    pub beta: Tensor,  // Shift parameter [embedding_dim]
    pub epsilon: f32,
}

impl AddNorm {
    /// gamma = 1, beta = 0, epsilon = 1e-5
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            gamma: Tensor::filled_vector(embedding_dim, 1.0),
            beta: Tensor::filled_vector(embedding_dim, 0.0),
            epsilon: 1e-5,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.gamma.data.len()
    }

    /// Forward pass
    ///
    /// `input` and `residual` must both be `[seq_len, embedding_dim]`.
    pub fn forward(&self, input: &Tensor, residual: &Tensor) -> Result<(Tensor, AddNormCache)> {
        let n = self.embedding_dim();
        input.ensure_width(n, "add-norm input")?;
        if input.shape != residual.shape {
            return Err(ViolaError::shape(format!(
                "add-norm residual {:?} does not match input {:?}",
                residual.shape, input.shape
            )));
        }

        let add = input.add(residual)?;
        let epsilon = self.epsilon;

        // Per-row statistics
        let (mean, std_eps): (Vec<f32>, Vec<f32>) = add
            .data
            .par_chunks(n)
            .map(|row| {
                let mean = row.iter().sum::<f32>() / n as f32;
                let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
                (mean, var.sqrt() + epsilon)
            })
            .unzip();

        let mut norm = add.clone();
        norm.data
            .par_chunks_mut(n)
            .zip(mean.par_iter().zip(&std_eps))
            .for_each(|(row, (&m, &s))| {
                for v in row.iter_mut() {
                    *v = (*v - m) / s;
                }
            });

        let mut y = norm.clone();
        for row in y.data.chunks_mut(n) {
            for ((v, g), b) in row.iter_mut().zip(&self.gamma.data).zip(&self.beta.data) {
                *v = *v * g + b;
            }
        }

        let cache = AddNormCache {
            add,
            mean,
            std_eps,
            norm,
        };
        Ok((y, cache))
    }

    /// Backward pass
    ///
    /// Returns the gradient w.r.t. the pre-norm sum and applies SGD to
    /// gamma and beta.
    pub fn backward(&mut self, grad_out: &Tensor, cache: &AddNormCache, lr: f32) -> Result<Tensor> {
        let n = self.embedding_dim();
        grad_out.ensure_shape(&cache.norm.shape, "add-norm output gradient")?;
        let seq_len = grad_out.rows();

        // Compute grad_gamma and grad_beta by accumulating over sequence
        let mut grad_gamma = vec![0.0; n];
        let mut grad_beta = vec![0.0; n];
        for i in 0..seq_len {
            for j in 0..n {
                let idx = i * n + j;
                grad_gamma[j] += grad_out.data[idx] * cache.norm.data[idx];
                grad_beta[j] += grad_out.data[idx];
            }
        }

        let mut grad_add = vec![0.0; seq_len * n];
        for i in 0..seq_len {
            let start = i * n;
            let grad_row = &grad_out.data[start..start + n];
            let norm_row = &cache.norm.data[start..start + n];
            let g: Vec<f32> = grad_row
                .iter()
                .zip(&self.gamma.data)
                .map(|(d, gamma)| d * gamma)
                .collect();

            let mean_g = g.iter().sum::<f32>() / n as f32;
            let mean_g_norm = g
                .iter()
                .zip(norm_row)
                .map(|(g, x)| g * x)
                .sum::<f32>()
                / n as f32;

            for j in 0..n {
                grad_add[start + j] =
                    (g[j] - mean_g - norm_row[j] * mean_g_norm) / cache.std_eps[i];
            }
        }

        self.gamma.sgd_step(&Tensor::from_parts(grad_gamma, vec![n]), lr)?;
        self.beta.sgd_step(&Tensor::from_parts(grad_beta, vec![n]), lr)?;

        Ok(Tensor::from_parts(grad_add, grad_out.shape.clone()))
    }

    /// Backward pass for an output that fed two downstream consumers: the
    /// two upstream gradients are summed first.
    pub fn backward_sum(
        &mut self,
        grad_a: &Tensor,
        grad_b: &Tensor,
        cache: &AddNormCache,
        lr: f32,
    ) -> Result<Tensor> {
        let grad = grad_a.add(grad_b)?;
        self.backward(&grad, cache, lr)
    }
}

impl Parameters for AddNorm {
    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.gamma, &self.beta]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

/// Cache for add-norm backward pass
pub struct AddNormCache {
    pub add: Tensor,
    pub mean: Vec<f32>,
    pub std_eps: Vec<f32>,
    pub norm: Tensor,
}
