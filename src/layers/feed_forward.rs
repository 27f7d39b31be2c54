//! Position-wise Feed-Forward Network
//!
//! ```text
//! x → Linear1 (W1, b1) → ReLU → Linear2 (W2, b2) → y
//! [seq, embedding_dim] → [seq, hidden_dim] → [seq, embedding_dim]
//! ```
//!
//! Both weight matrices are drawn from `Normal(0, 1/√embedding_dim)`; the
//! biases start at zero.

use super::linear::{Linear, LinearCache};
use super::Parameters;
use crate::error::Result;
use crate::tensor::Tensor;
use rand::Rng;
use rayon::prelude::*;

/// ReLU activation (forward pass)
pub fn relu_forward(x: &Tensor) -> Tensor {
    let data = x.data.par_iter().map(|&v| v.max(0.0)).collect();
    Tensor::from_parts(data, x.shape.clone())
}

/// ReLU backward: pass the gradient where the pre-activation was positive.
pub fn relu_backward(grad_out: &Tensor, pre_activation: &Tensor) -> Result<Tensor> {
    grad_out.ensure_shape(&pre_activation.shape, "relu gradient")?;
    let data = grad_out
        .data
        .par_iter()
        .zip(&pre_activation.data)
        .map(|(&g, &z)| if z > 0.0 { g } else { 0.0 })
        .collect();
    Ok(Tensor::from_parts(data, grad_out.shape.clone()))
}

/// Two-layer feed-forward block with ReLU
pub struct FeedForward {
    pub fc1: Linear,
    pub fc2: Linear,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(
        embedding_dim: usize,
        hidden_dim: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let std_dev = 1.0 / (embedding_dim as f32).sqrt();
        Ok(Self {
            fc1: Linear::new(embedding_dim, hidden_dim, true, std_dev, rng)?,
            fc2: Linear::new(hidden_dim, embedding_dim, true, std_dev, rng)?,
        })
    }

    /// Forward pass: x → fc1 → ReLU → fc2
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, FeedForwardCache)> {
        let (pre_activation, fc1_cache) = self.fc1.forward(x)?;
        let activation = relu_forward(&pre_activation);
        let (y, fc2_cache) = self.fc2.forward(&activation)?;

        let cache = FeedForwardCache {
            fc1_cache,
            pre_activation,
            fc2_cache,
        };
        Ok((y, cache))
    }

    /// Backward pass: fc2 → ReLU mask → fc1, updating both layers.
    pub fn backward(
        &mut self,
        grad_out: &Tensor,
        cache: &FeedForwardCache,
        lr: f32,
    ) -> Result<Tensor> {
        let grad_activation = self.fc2.backward(grad_out, &cache.fc2_cache, lr)?;
        let grad_pre = relu_backward(&grad_activation, &cache.pre_activation)?;
        self.fc1.backward(&grad_pre, &cache.fc1_cache, lr)
    }
}

impl Parameters for FeedForward {
    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.fc1.parameters();
        params.extend(self.fc2.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.fc1.parameters_mut();
        params.extend(self.fc2.parameters_mut());
        params
    }
}

/// Cache for feed-forward backward pass
///
/// The post-ReLU activation is the input cached by `fc2`.
pub struct FeedForwardCache {
    pub fc1_cache: LinearCache,
    pub pre_activation: Tensor,
    pub fc2_cache: LinearCache,
}

impl FeedForwardCache {
    pub fn activation(&self) -> &Tensor {
        &self.fc2_cache.x
    }
}
