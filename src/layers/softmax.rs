//! Softmax and Cross-Entropy Gradient
//!
//! Converts each row of logits into a probability distribution:
//!
//! ```text
//! p[i][j] = exp(x[i][j] - max_i) / Σ_k exp(x[i][k] - max_i)
//! ```
//!
//! Subtracting the row maximum keeps `exp` from overflowing and leaves the
//! result unchanged.
//!
//! ## Backward Pass
//!
//! Softmax couples every element of a row, so the backward pass is a
//! Jacobian-vector product per row:
//!
//! ```text
//! grad_x[i][j] = p[i][j] * (grad_p[i][j] - Σ_k p[i][k] * grad_p[i][k])
//! ```
//!
//! The same two free functions are used per head inside attention.

use crate::error::{Result, ViolaError};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Added to probabilities before dividing in the cross-entropy gradient.
const PROB_EPSILON: f32 = 1e-8;

/// Row-wise softmax, rows processed in parallel.
pub fn softmax_rows(x: &Tensor) -> Tensor {
    let cols = x.cols().max(1);
    let data: Vec<f32> = x
        .data
        .par_chunks(cols)
        .flat_map_iter(|row| {
            let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = row.iter().map(|&v| (v - max_val).exp()).collect();
            let sum: f32 = exps.iter().sum();
            exps.into_iter().map(move |e| e / sum)
        })
        .collect();
    Tensor::from_parts(data, x.shape.clone())
}

/// Softmax backward given the forward probabilities.
pub fn softmax_backward(probs: &Tensor, grad_probs: &Tensor) -> Result<Tensor> {
    if probs.shape != grad_probs.shape {
        return Err(ViolaError::shape(format!(
            "softmax gradient {:?} does not match probabilities {:?}",
            grad_probs.shape, probs.shape
        )));
    }
    let cols = probs.cols().max(1);
    let data: Vec<f32> = probs
        .data
        .par_chunks(cols)
        .zip(grad_probs.data.par_chunks(cols))
        .flat_map_iter(|(p_row, g_row)| {
            let dot: f32 = p_row.iter().zip(g_row).map(|(p, g)| p * g).sum();
            p_row
                .iter()
                .zip(g_row)
                .map(move |(&p, &g)| p * (g - dot))
                .collect::<Vec<_>>()
        })
        .collect();
    Ok(Tensor::from_parts(data, probs.shape.clone()))
}

/// Output softmax of the model
///
/// Stateless; the probabilities live in the returned cache.
#[derive(Clone, Copy, Debug, Default)]
pub struct Softmax;

impl Softmax {
    pub fn new() -> Self {
        Self
    }

    /// Forward pass
    ///
    /// Returns the probabilities and a cache holding a copy of them.
    pub fn forward(&self, logits: &Tensor) -> Result<(Tensor, SoftmaxCache)> {
        if logits.shape.len() != 2 || logits.data.is_empty() {
            return Err(ViolaError::EmptyInput(format!(
                "softmax needs a non-empty matrix, got {:?}",
                logits.shape
            )));
        }
        let probs = softmax_rows(logits);
        Ok((probs.clone(), SoftmaxCache { probs }))
    }

    /// Backward pass: gradient w.r.t. the logits.
    pub fn backward(&self, grad_probs: &Tensor, cache: &SoftmaxCache) -> Result<Tensor> {
        softmax_backward(&cache.probs, grad_probs)
    }

    /// Gradient of the cross-entropy loss w.r.t. the probabilities.
    ///
    /// `-t / (p + 1e-8)` where the target is non-zero, 0 elsewhere.
    pub fn grad_output_model(&self, target: &Tensor, cache: &SoftmaxCache) -> Result<Tensor> {
        if target.shape != cache.probs.shape {
            return Err(ViolaError::shape(format!(
                "target {:?} does not match probabilities {:?}",
                target.shape, cache.probs.shape
            )));
        }
        let data = target
            .data
            .par_iter()
            .zip(&cache.probs.data)
            .map(|(&t, &p)| if t != 0.0 { -t / (p + PROB_EPSILON) } else { 0.0 })
            .collect();
        Ok(Tensor::from_parts(data, target.shape.clone()))
    }
}

/// Cache for softmax backward pass
pub struct SoftmaxCache {
    pub probs: Tensor,
}
