//! Encoder
//!
//! Each encoder layer is two post-norm sub-blocks:
//!
//! ```text
//! x → MHA (no mask) → AddNorm(·, x) → norm1 → FeedForward → AddNorm(·, norm1) → y
//! │                      ↑             │                        ↑
//! └──────────────────────┘             └────────────────────────┘
//! ```
//!
//! ## Backward Pass
//!
//! Each residual splits the gradient into two paths that are summed:
//!
//! ```text
//! g_add_ff  = add_norm_ff.backward(g)
//! g_ff      = ff.backward(g_add_ff)
//! g_add_mha = add_norm_mha.backward(g_add_ff + g_ff)   (norm1 fed both)
//! g_mha     = mha.backward(g_add_mha)
//! g_x       = g_add_mha + g_mha                        (x fed both)
//! ```

use super::add_norm::{AddNorm, AddNormCache};
use super::attention::{AttentionCache, MultiHeadAttention};
use super::feed_forward::{FeedForward, FeedForwardCache};
use super::Parameters;
use crate::config::Config;
use crate::error::{Result, ViolaError};
use crate::tensor::Tensor;
use rand::Rng;

/// One encoder layer
pub struct EncoderLayer {
    pub mha: MultiHeadAttention,
    pub add_norm_mha: AddNorm,
    pub ff: FeedForward,
    pub add_norm_ff: AddNorm,
}

impl EncoderLayer {
    pub fn new<R: Rng + ?Sized>(config: &Config, rng: &mut R) -> Result<Self> {
        Ok(Self {
            mha: MultiHeadAttention::new(config.num_heads, config.embedding_dim, rng)?,
            add_norm_mha: AddNorm::new(config.embedding_dim),
            ff: FeedForward::new(config.embedding_dim, config.hidden_dim, rng)?,
            add_norm_ff: AddNorm::new(config.embedding_dim),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, EncoderLayerCache)> {
        let (mha_out, mha_cache) = self.mha.forward(x, false)?;
        let (norm1, add_norm_mha_cache) = self.add_norm_mha.forward(&mha_out, x)?;
        let (ff_out, ff_cache) = self.ff.forward(&norm1)?;
        let (y, add_norm_ff_cache) = self.add_norm_ff.forward(&ff_out, &norm1)?;

        let cache = EncoderLayerCache {
            mha_cache,
            add_norm_mha_cache,
            ff_cache,
            add_norm_ff_cache,
        };
        Ok((y, cache))
    }

    pub fn backward(
        &mut self,
        grad_out: &Tensor,
        cache: &EncoderLayerCache,
        lr: f32,
    ) -> Result<Tensor> {
        let grad_add_ff = self.add_norm_ff.backward(grad_out, &cache.add_norm_ff_cache, lr)?;
        let grad_ff = self.ff.backward(&grad_add_ff, &cache.ff_cache, lr)?;

        let grad_add_mha =
            self.add_norm_mha
                .backward_sum(&grad_add_ff, &grad_ff, &cache.add_norm_mha_cache, lr)?;
        let grad_mha = self.mha.backward(&grad_add_mha, &cache.mha_cache, lr)?;

        grad_add_mha.add(&grad_mha)
    }
}

impl Parameters for EncoderLayer {
    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.mha.parameters();
        params.extend(self.add_norm_mha.parameters());
        params.extend(self.ff.parameters());
        params.extend(self.add_norm_ff.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.mha.parameters_mut();
        params.extend(self.add_norm_mha.parameters_mut());
        params.extend(self.ff.parameters_mut());
        params.extend(self.add_norm_ff.parameters_mut());
        params
    }
}

/// Cache for encoder layer backward pass
pub struct EncoderLayerCache {
    pub mha_cache: AttentionCache,
    pub add_norm_mha_cache: AddNormCache,
    pub ff_cache: FeedForwardCache,
    pub add_norm_ff_cache: AddNormCache,
}

/// Stack of `num_layers` encoder layers
pub struct Encoder {
    pub layers: Vec<EncoderLayer>,
}

impl Encoder {
    pub fn new<R: Rng + ?Sized>(config: &Config, rng: &mut R) -> Result<Self> {
        let layers = (0..config.num_layers)
            .map(|_| EncoderLayer::new(config, rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Run the stack; caches are returned in layer order.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Vec<EncoderLayerCache>)> {
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut current = x.clone();
        for layer in &self.layers {
            let (out, cache) = layer.forward(&current)?;
            caches.push(cache);
            current = out;
        }
        Ok((current, caches))
    }

    /// Backward through the stack, last layer first.
    pub fn backward(
        &mut self,
        grad_out: &Tensor,
        caches: &[EncoderLayerCache],
        lr: f32,
    ) -> Result<Tensor> {
        check_cache_count(caches.len(), self.layers.len())?;
        let mut grad = grad_out.clone();
        for (layer, cache) in self.layers.iter_mut().zip(caches).rev() {
            grad = layer.backward(&grad, cache, lr)?;
        }
        Ok(grad)
    }
}

impl Parameters for Encoder {
    fn parameters(&self) -> Vec<&Tensor> {
        self.layers.iter().flat_map(EncoderLayer::parameters).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers.iter_mut().flat_map(EncoderLayer::parameters_mut).collect()
    }
}

pub(crate) fn check_cache_count(caches: usize, layers: usize) -> Result<()> {
    if caches != layers {
        return Err(ViolaError::InvalidCall(format!(
            "{} layer caches supplied for {} layers",
            caches, layers
        )));
    }
    Ok(())
}
