//! Linear Layer (Fully Connected)
//!
//! Performs an affine transformation: y = x @ W (+ b)
//!
//! The same layer serves as the feed-forward projections (with bias), the
//! four attention projections and the output head (both without bias).
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [seq_len, in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]        (optional)
//! Output: y = x @ W + b [seq_len, out_features]
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```
//!
//! `grad_x` is computed against the weights used in the forward pass; the
//! SGD step is applied afterwards.

use super::Parameters;
use crate::error::{Result, ViolaError};
use crate::tensor::Tensor;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Draw a `[rows, cols]` matrix from `Normal(0, std_dev)`.
pub fn normal_init<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    std_dev: f32,
    rng: &mut R,
) -> Result<Tensor> {
    let normal = Normal::new(0.0f32, std_dev).map_err(|e| {
        ViolaError::InvalidConfig(format!("invalid init std dev {}: {}", std_dev, e))
    })?;
    let data = (0..rows * cols).map(|_| normal.sample(rng)).collect();
    Tensor::new(data, vec![rows, cols])
}

/// Linear layer
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    /// Create a layer with weights drawn from `Normal(0, std_dev)` and, if
    /// requested, a zero bias.
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        with_bias: bool,
        std_dev: f32,
        rng: &mut R,
    ) -> Result<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(ViolaError::InvalidConfig(format!(
                "linear layer needs positive sizes, got {}x{}",
                in_features, out_features
            )));
        }
        Ok(Self {
            weight: normal_init(in_features, out_features, std_dev, rng)?,
            bias: with_bias.then(|| Tensor::filled_vector(out_features, 0.0)),
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape[1]
    }

    /// Forward pass
    ///
    /// Computes y = x @ W + b and caches x for the backward pass.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, LinearCache)> {
        x.ensure_width(self.in_features(), "linear input")?;
        let mut y = x.matmul(&self.weight)?;
        if let Some(bias) = &self.bias {
            y = y.add_row_vector(bias)?;
        }
        Ok((y, LinearCache { x: x.clone() }))
    }

    /// Backward pass
    ///
    /// Returns the gradient w.r.t. the input and applies `param -= lr * grad`
    /// to the weight and bias.
    pub fn backward(&mut self, grad_out: &Tensor, cache: &LinearCache, lr: f32) -> Result<Tensor> {
        grad_out.ensure_shape(&[cache.x.rows(), self.out_features()], "linear output gradient")?;

        let grad_weight = cache.x.transpose().matmul(grad_out)?;
        let grad_x = grad_out.matmul(&self.weight.transpose())?;

        self.weight.sgd_step(&grad_weight, lr)?;
        if let Some(bias) = &mut self.bias {
            bias.sgd_step(&grad_out.sum_rows(), lr)?;
        }
        Ok(grad_x)
    }
}

impl Parameters for Linear {
    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        params
    }
}

/// Cache for linear layer backward pass
pub struct LinearCache {
    pub x: Tensor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn layer(with_bias: bool) -> Linear {
        let mut layer = Linear::new(2, 2, with_bias, 1.0, &mut StdRng::seed_from_u64(0)).unwrap();
        layer.weight = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        layer
    }

    #[test]
    fn test_forward_with_bias() {
        let mut l = layer(true);
        l.bias = Some(Tensor::new(vec![0.5, -0.5], vec![2]).unwrap());
        let x = Tensor::from_rows(&[vec![1.0, 1.0]]).unwrap();
        let (y, _) = l.forward(&x).unwrap();
        assert_eq!(y.data, vec![4.5, 5.5]);
    }

    #[test]
    fn test_backward_updates_and_returns_input_grad() {
        let mut l = layer(true);
        let x = Tensor::from_rows(&[vec![1.0, 2.0]]).unwrap();
        let (_, cache) = l.forward(&x).unwrap();
        let grad = Tensor::from_rows(&[vec![1.0, 0.0]]).unwrap();
        let grad_x = l.backward(&grad, &cache, 0.1).unwrap();

        // grad_x uses the pre-update weights: [1, 0] @ W^T = [1, 3]
        assert_eq!(grad_x.data, vec![1.0, 3.0]);
        // grad_W = x^T @ grad = [[1, 0], [2, 0]]
        let expected = [0.9, 2.0, 2.8, 4.0];
        for (w, e) in l.weight.data.iter().zip(expected) {
            assert!((w - e).abs() < 1e-6);
        }
        assert_eq!(l.bias.as_ref().unwrap().data, vec![-0.1, 0.0]);
    }

    #[test]
    fn test_wrong_width_rejected() {
        let l = layer(false);
        let x = Tensor::zeros(1, 3);
        assert!(matches!(l.forward(&x), Err(ViolaError::ShapeMismatch(_))));
    }

    #[test]
    fn test_parameter_count() {
        assert_eq!(layer(true).parameter_count(), 6);
        assert_eq!(layer(false).parameter_count(), 4);
    }
}
