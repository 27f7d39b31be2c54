//! Decoder
//!
//! Each decoder layer has three post-norm sub-blocks:
//!
//! ```text
//! x ─→ masked MHA ─→ AddNorm(·, x) ─→ norm1
//! norm1 ─→ cross MHA (K/V = encoder output) ─→ AddNorm(·, norm1) ─→ norm2
//! norm2 ─→ FeedForward ─→ AddNorm(·, norm2) ─→ y
//! ```
//!
//! ## Backward Pass
//!
//! `norm1` feeds both the cross-attention queries and the cross residual,
//! and `norm2` feeds both the feed-forward block and its residual, so each
//! AddNorm receives the sum of two upstream gradients:
//!
//! ```text
//! g_add_ff     = add_norm_ff.backward(g)
//! g_ff         = ff.backward(g_add_ff)
//! g_add_cross  = add_norm_cross.backward(g_add_ff + g_ff)
//! (g_q, g_enc) = cross_mha.backward_cross(g_add_cross)
//! g_add_masked = add_norm_masked.backward(g_add_cross + g_q)
//! g_masked     = masked_mha.backward(g_add_masked)
//! g_x          = g_add_masked + g_masked
//! ```
//!
//! The encoder output is shared by every layer of the stack, so the stack
//! sums `g_enc` over all layers.

use super::add_norm::{AddNorm, AddNormCache};
use super::attention::{AttentionCache, MultiHeadAttention};
use super::encoder::check_cache_count;
use super::feed_forward::{FeedForward, FeedForwardCache};
use super::Parameters;
use crate::config::Config;
use crate::error::{Result, ViolaError};
use crate::tensor::Tensor;
use rand::Rng;

/// One decoder layer
pub struct DecoderLayer {
    pub masked_mha: MultiHeadAttention,
    pub add_norm_masked: AddNorm,
    pub cross_mha: MultiHeadAttention,
    pub add_norm_cross: AddNorm,
    pub ff: FeedForward,
    pub add_norm_ff: AddNorm,
}

impl DecoderLayer {
    pub fn new<R: Rng + ?Sized>(config: &Config, rng: &mut R) -> Result<Self> {
        Ok(Self {
            masked_mha: MultiHeadAttention::new(config.num_heads, config.embedding_dim, rng)?,
            add_norm_masked: AddNorm::new(config.embedding_dim),
            cross_mha: MultiHeadAttention::new(config.num_heads, config.embedding_dim, rng)?,
            add_norm_cross: AddNorm::new(config.embedding_dim),
            ff: FeedForward::new(config.embedding_dim, config.hidden_dim, rng)?,
            add_norm_ff: AddNorm::new(config.embedding_dim),
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        encoder_output: &Tensor,
    ) -> Result<(Tensor, DecoderLayerCache)> {
        let (masked_out, masked_cache) = self.masked_mha.forward(x, true)?;
        let (norm1, add_norm_masked_cache) = self.add_norm_masked.forward(&masked_out, x)?;

        let (cross_out, cross_cache) = self.cross_mha.forward_cross(&norm1, encoder_output)?;
        let (norm2, add_norm_cross_cache) = self.add_norm_cross.forward(&cross_out, &norm1)?;

        let (ff_out, ff_cache) = self.ff.forward(&norm2)?;
        let (y, add_norm_ff_cache) = self.add_norm_ff.forward(&ff_out, &norm2)?;

        let cache = DecoderLayerCache {
            masked_cache,
            add_norm_masked_cache,
            cross_cache,
            add_norm_cross_cache,
            ff_cache,
            add_norm_ff_cache,
        };
        Ok((y, cache))
    }

    /// Returns `(grad_input, grad_encoder_output)`.
    pub fn backward(
        &mut self,
        grad_out: &Tensor,
        cache: &DecoderLayerCache,
        lr: f32,
    ) -> Result<(Tensor, Tensor)> {
        let grad_add_ff = self.add_norm_ff.backward(grad_out, &cache.add_norm_ff_cache, lr)?;
        let grad_ff = self.ff.backward(&grad_add_ff, &cache.ff_cache, lr)?;

        let grad_add_cross =
            self.add_norm_cross
                .backward_sum(&grad_add_ff, &grad_ff, &cache.add_norm_cross_cache, lr)?;
        let (grad_query, grad_encoder) =
            self.cross_mha
                .backward_cross(&grad_add_cross, &cache.cross_cache, lr)?;

        let grad_add_masked = self.add_norm_masked.backward_sum(
            &grad_add_cross,
            &grad_query,
            &cache.add_norm_masked_cache,
            lr,
        )?;
        let grad_masked = self
            .masked_mha
            .backward(&grad_add_masked, &cache.masked_cache, lr)?;

        Ok((grad_add_masked.add(&grad_masked)?, grad_encoder))
    }
}

impl Parameters for DecoderLayer {
    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.masked_mha.parameters();
        params.extend(self.add_norm_masked.parameters());
        params.extend(self.cross_mha.parameters());
        params.extend(self.add_norm_cross.parameters());
        params.extend(self.ff.parameters());
        params.extend(self.add_norm_ff.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.masked_mha.parameters_mut();
        params.extend(self.add_norm_masked.parameters_mut());
        params.extend(self.cross_mha.parameters_mut());
        params.extend(self.add_norm_cross.parameters_mut());
        params.extend(self.ff.parameters_mut());
        params.extend(self.add_norm_ff.parameters_mut());
        params
    }
}

/// Cache for decoder layer backward pass
pub struct DecoderLayerCache {
    pub masked_cache: AttentionCache,
    pub add_norm_masked_cache: AddNormCache,
    pub cross_cache: AttentionCache,
    pub add_norm_cross_cache: AddNormCache,
    pub ff_cache: FeedForwardCache,
    pub add_norm_ff_cache: AddNormCache,
}

/// Stack of `num_layers` decoder layers
pub struct Decoder {
    pub layers: Vec<DecoderLayer>,
}

impl Decoder {
    pub fn new<R: Rng + ?Sized>(config: &Config, rng: &mut R) -> Result<Self> {
        let layers = (0..config.num_layers)
            .map(|_| DecoderLayer::new(config, rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Run the stack with every layer attending to the same encoder output.
    pub fn forward(
        &self,
        x: &Tensor,
        encoder_output: &Tensor,
    ) -> Result<(Tensor, Vec<DecoderLayerCache>)> {
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut current = x.clone();
        for layer in &self.layers {
            let (out, cache) = layer.forward(&current, encoder_output)?;
            caches.push(cache);
            current = out;
        }
        Ok((current, caches))
    }

    /// Backward through the stack, last layer first.
    ///
    /// Returns `(grad_input, grad_encoder_output)` where the encoder-output
    /// gradient is summed over all layers.
    pub fn backward(
        &mut self,
        grad_out: &Tensor,
        caches: &[DecoderLayerCache],
        lr: f32,
    ) -> Result<(Tensor, Tensor)> {
        check_cache_count(caches.len(), self.layers.len())?;
        let mut grad = grad_out.clone();
        let mut grad_encoder: Option<Tensor> = None;
        for (layer, cache) in self.layers.iter_mut().zip(caches).rev() {
            let (grad_input, grad_enc) = layer.backward(&grad, cache, lr)?;
            grad_encoder = Some(match grad_encoder {
                Some(total) => total.add(&grad_enc)?,
                None => grad_enc,
            });
            grad = grad_input;
        }
        let grad_encoder = grad_encoder
            .ok_or_else(|| ViolaError::InvalidCall("decoder has no layers".into()))?;
        Ok((grad, grad_encoder))
    }
}

impl Parameters for Decoder {
    fn parameters(&self) -> Vec<&Tensor> {
        self.layers.iter().flat_map(DecoderLayer::parameters).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers.iter_mut().flat_map(DecoderLayer::parameters_mut).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(num_layers: usize) -> Config {
        Config {
            vocab_size: 10,
            embedding_dim: 4,
            num_layers,
            num_heads: 2,
            hidden_dim: 8,
            seed: 0,
        }
    }

    fn target() -> Tensor {
        Tensor::from_rows(&[vec![0.3, -0.5, 0.2, 0.8], vec![-0.1, 0.6, -0.9, 0.4]]).unwrap()
    }

    fn encoder_output() -> Tensor {
        Tensor::from_rows(&[
            vec![0.9, -0.2, 0.4, -0.6],
            vec![0.1, 0.3, -0.8, 0.5],
            vec![-0.4, 0.7, 0.2, 0.0],
        ])
        .unwrap()
    }

    fn upstream() -> Tensor {
        Tensor::from_rows(&[vec![0.4, 0.1, -0.3, 0.6], vec![-0.2, 0.5, 0.3, -0.1]]).unwrap()
    }

    fn objective(decoder: &Decoder, x: &Tensor, enc: &Tensor) -> f32 {
        let (y, _) = decoder.forward(x, enc).unwrap();
        y.data.iter().zip(&upstream().data).map(|(a, b)| a * b).sum()
    }

    fn numeric_grad(f: impl Fn(&Tensor) -> f32, at: &Tensor) -> Vec<f32> {
        let h = 5e-3;
        (0..at.data.len())
            .map(|idx| {
                let mut plus = at.clone();
                plus.data[idx] += h;
                let mut minus = at.clone();
                minus.data[idx] -= h;
                (f(&plus) - f(&minus)) / (2.0 * h)
            })
            .collect()
    }

    #[test]
    fn test_shapes_with_different_lengths() {
        let decoder = Decoder::new(&config(1), &mut StdRng::seed_from_u64(2)).unwrap();
        let (y, caches) = decoder.forward(&target(), &encoder_output()).unwrap();
        assert_eq!(y.shape, vec![2, 4]);
        assert_eq!(caches[0].cross_cache.weights[0].shape, vec![2, 3]);
    }

    #[test]
    fn test_stack_gradients_match_finite_difference() {
        // two layers: the encoder gradient must include both contributions
        let decoder = Decoder::new(&config(2), &mut StdRng::seed_from_u64(8)).unwrap();
        let x = target();
        let enc = encoder_output();

        let numeric_x = numeric_grad(|x| objective(&decoder, x, &enc), &x);
        let numeric_enc = numeric_grad(|e| objective(&decoder, &x, e), &enc);

        let mut decoder = decoder;
        let (_, caches) = decoder.forward(&x, &enc).unwrap();
        let (grad_x, grad_enc) = decoder.backward(&upstream(), &caches, 0.0).unwrap();

        for (n, a) in numeric_x.iter().zip(&grad_x.data) {
            assert!((n - a).abs() < 5e-2, "target: numeric {} vs analytic {}", n, a);
        }
        for (n, a) in numeric_enc.iter().zip(&grad_enc.data) {
            assert!((n - a).abs() < 5e-2, "encoder: numeric {} vs analytic {}", n, a);
        }
    }

    #[test]
    fn test_future_target_tokens_do_not_affect_earlier_rows() {
        let decoder = Decoder::new(&config(1), &mut StdRng::seed_from_u64(3)).unwrap();
        let enc = encoder_output();
        let x = target();
        let mut changed = x.clone();
        changed.row_mut(1).copy_from_slice(&[5.0, -5.0, 5.0, -5.0]);

        let (a, _) = decoder.forward(&x, &enc).unwrap();
        let (b, _) = decoder.forward(&changed, &enc).unwrap();
        for (p, q) in a.row(0).iter().zip(b.row(0)) {
            assert!((p - q).abs() < 1e-6);
        }
    }
}
