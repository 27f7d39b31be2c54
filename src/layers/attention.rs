//! Multi-Head Attention
//!
//! Attention lets every position gather information from a set of other
//! positions. The same block is used three ways in the model:
//!
//! - encoder self-attention (no mask)
//! - decoder masked self-attention (strict causal mask)
//! - decoder cross-attention (queries from the decoder, keys and values
//!   from the encoder output, never masked)
//!
//! ## Scaled Dot-Product Attention
//!
//! ```text
//! Q, K, V = x_q @ W_q, x_kv @ W_k, x_kv @ W_v
//! split Q, K, V into num_heads column groups of width head_dim
//! scores_h  = (Q_h @ K_h^T) / √head_dim
//! weights_h = softmax(masked scores_h)
//! out_h     = weights_h @ V_h
//! output    = concat(out_h) @ W_o
//! ```
//!
//! The projections have no bias.
//!
//! ## Causal Masking
//!
//! With the mask enabled, `score[i][j] = -1e9` for `j > i`, so position `i`
//! only sees positions `0..=i` and the masked weights are exactly zero.
//!
//! ## Backward Pass
//!
//! 1. Backprop through the output projection
//! 2. Split the gradient per head; for each head (in parallel):
//!    - grad_V = weights^T @ grad_out
//!    - grad_weights = grad_out @ V^T
//!    - grad_scores = softmax backward (row-coupled)
//!    - grad_Q = grad_scores @ K / √head_dim
//!    - grad_K = grad_scores^T @ Q / √head_dim
//! 3. Merge the heads and backprop through the Q, K, V projections
//!
//! For self-attention the three input gradients all flow to the same input
//! and are summed. For cross-attention the query gradient goes to the
//! decoder side and the key/value gradients to the encoder output.

use super::linear::{Linear, LinearCache};
use super::softmax::{softmax_backward, softmax_rows};
use super::Parameters;
use crate::error::{Result, ViolaError};
use crate::tensor::Tensor;
use rand::Rng;
use rayon::prelude::*;

/// Score assigned to masked (future) positions.
const MASK_VALUE: f32 = -1e9;

/// Which attention variant produced a cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttentionKind {
    SelfAttention { causal: bool },
    Cross,
}

/// Split `[seq_len, num_heads * head_dim]` into `num_heads` tensors of
/// `[seq_len, head_dim]`.
pub fn split_heads(x: &Tensor, num_heads: usize) -> Vec<Tensor> {
    let seq_len = x.rows();
    let head_dim = x.cols() / num_heads;
    (0..num_heads)
        .map(|h| {
            let mut data = Vec::with_capacity(seq_len * head_dim);
            for i in 0..seq_len {
                data.extend_from_slice(&x.row(i)[h * head_dim..(h + 1) * head_dim]);
            }
            Tensor::from_parts(data, vec![seq_len, head_dim])
        })
        .collect()
}

/// Concatenate per-head tensors back along the feature dimension.
pub fn merge_heads(heads: &[Tensor]) -> Tensor {
    let seq_len = heads.first().map_or(0, Tensor::rows);
    let head_dim = heads.first().map_or(0, Tensor::cols);
    let width = head_dim * heads.len();
    let mut out = Tensor::zeros(seq_len, width);
    for (h, head) in heads.iter().enumerate() {
        for i in 0..seq_len {
            out.row_mut(i)[h * head_dim..(h + 1) * head_dim].copy_from_slice(head.row(i));
        }
    }
    out
}

/// Multi-head attention with Q/K/V/O projections
pub struct MultiHeadAttention {
    pub w_q: Linear,
    pub w_k: Linear,
    pub w_v: Linear,
    pub w_o: Linear,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl MultiHeadAttention {
    /// Create an attention block.
    ///
    /// Fails with `InvalidConfig` unless `num_heads` divides `embedding_dim`.
    pub fn new<R: Rng + ?Sized>(
        num_heads: usize,
        embedding_dim: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if num_heads == 0 || embedding_dim == 0 || embedding_dim % num_heads != 0 {
            return Err(ViolaError::InvalidConfig(format!(
                "embedding_dim ({}) must be a positive multiple of num_heads ({})",
                embedding_dim, num_heads
            )));
        }
        let std_dev = 1.0 / (embedding_dim as f32).sqrt();
        Ok(Self {
            w_q: Linear::new(embedding_dim, embedding_dim, false, std_dev, rng)?,
            w_k: Linear::new(embedding_dim, embedding_dim, false, std_dev, rng)?,
            w_v: Linear::new(embedding_dim, embedding_dim, false, std_dev, rng)?,
            w_o: Linear::new(embedding_dim, embedding_dim, false, std_dev, rng)?,
            num_heads,
            head_dim: embedding_dim / num_heads,
        })
    }

    pub fn embedding_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Self-attention over `x`, optionally with the strict causal mask.
    pub fn forward(&self, x: &Tensor, causal: bool) -> Result<(Tensor, AttentionCache)> {
        self.attend(x, x, AttentionKind::SelfAttention { causal })
    }

    /// Cross-attention: queries from `query_input`, keys and values from
    /// `kv_input`. The two sequence lengths may differ.
    pub fn forward_cross(
        &self,
        query_input: &Tensor,
        kv_input: &Tensor,
    ) -> Result<(Tensor, AttentionCache)> {
        self.attend(query_input, kv_input, AttentionKind::Cross)
    }

    fn attend(
        &self,
        query_input: &Tensor,
        kv_input: &Tensor,
        kind: AttentionKind,
    ) -> Result<(Tensor, AttentionCache)> {
        let (q, q_cache) = self.w_q.forward(query_input)?;
        let (k, k_cache) = self.w_k.forward(kv_input)?;
        let (v, v_cache) = self.w_v.forward(kv_input)?;

        let q_heads = split_heads(&q, self.num_heads);
        let k_heads = split_heads(&k, self.num_heads);
        let v_heads = split_heads(&v, self.num_heads);

        let causal = matches!(kind, AttentionKind::SelfAttention { causal: true });
        let scale = 1.0 / (self.head_dim as f32).sqrt();

        let per_head: Vec<(Tensor, Tensor)> = q_heads
            .par_iter()
            .zip(&k_heads)
            .zip(&v_heads)
            .map(|((q_h, k_h), v_h)| -> Result<(Tensor, Tensor)> {
                let mut scores = q_h.matmul(&k_h.transpose())?.mul_scalar(scale);
                if causal {
                    apply_causal_mask(&mut scores);
                }
                let weights = softmax_rows(&scores);
                let out = weights.matmul(v_h)?;
                Ok((weights, out))
            })
            .collect::<Result<Vec<_>>>()?;
        let (weights, head_outputs): (Vec<Tensor>, Vec<Tensor>) = per_head.into_iter().unzip();

        let concat = merge_heads(&head_outputs);
        let (y, out_cache) = self.w_o.forward(&concat)?;

        let cache = AttentionCache {
            kind,
            q_cache,
            k_cache,
            v_cache,
            out_cache,
            q_heads,
            k_heads,
            v_heads,
            weights,
        };
        Ok((y, cache))
    }

    /// Backward pass for self-attention.
    ///
    /// Returns the summed gradient of the single input.
    pub fn backward(
        &mut self,
        grad_out: &Tensor,
        cache: &AttentionCache,
        lr: f32,
    ) -> Result<Tensor> {
        if cache.kind == AttentionKind::Cross {
            return Err(ViolaError::InvalidCall(
                "self-attention backward called with a cross-attention cache".into(),
            ));
        }
        let (grad_q_in, grad_k_in, grad_v_in) = self.backward_projections(grad_out, cache, lr)?;
        grad_q_in.add(&grad_k_in)?.add(&grad_v_in)
    }

    /// Backward pass for cross-attention.
    ///
    /// Returns `(grad_query_input, grad_kv_input)`.
    pub fn backward_cross(
        &mut self,
        grad_out: &Tensor,
        cache: &AttentionCache,
        lr: f32,
    ) -> Result<(Tensor, Tensor)> {
        if cache.kind != AttentionKind::Cross {
            return Err(ViolaError::InvalidCall(
                "cross-attention backward called with a self-attention cache".into(),
            ));
        }
        let (grad_q_in, grad_k_in, grad_v_in) = self.backward_projections(grad_out, cache, lr)?;
        Ok((grad_q_in, grad_k_in.add(&grad_v_in)?))
    }

    fn backward_projections(
        &mut self,
        grad_out: &Tensor,
        cache: &AttentionCache,
        lr: f32,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let grad_concat = self.w_o.backward(grad_out, &cache.out_cache, lr)?;
        let grad_heads = split_heads(&grad_concat, self.num_heads);
        let scale = 1.0 / (self.head_dim as f32).sqrt();

        let per_head: Vec<(Tensor, Tensor, Tensor)> = grad_heads
            .par_iter()
            .enumerate()
            .map(|(h, grad_h)| -> Result<(Tensor, Tensor, Tensor)> {
                let weights = &cache.weights[h];
                let grad_v = weights.transpose().matmul(grad_h)?;
                let grad_weights = grad_h.matmul(&cache.v_heads[h].transpose())?;
                let grad_scores = softmax_backward(weights, &grad_weights)?;
                let grad_q = grad_scores.matmul(&cache.k_heads[h])?.mul_scalar(scale);
                let grad_k = grad_scores.transpose().matmul(&cache.q_heads[h])?.mul_scalar(scale);
                Ok((grad_q, grad_k, grad_v))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut grad_q_heads = Vec::with_capacity(self.num_heads);
        let mut grad_k_heads = Vec::with_capacity(self.num_heads);
        let mut grad_v_heads = Vec::with_capacity(self.num_heads);
        for (q, k, v) in per_head {
            grad_q_heads.push(q);
            grad_k_heads.push(k);
            grad_v_heads.push(v);
        }

        let grad_q_in = self.w_q.backward(&merge_heads(&grad_q_heads), &cache.q_cache, lr)?;
        let grad_k_in = self.w_k.backward(&merge_heads(&grad_k_heads), &cache.k_cache, lr)?;
        let grad_v_in = self.w_v.backward(&merge_heads(&grad_v_heads), &cache.v_cache, lr)?;
        Ok((grad_q_in, grad_k_in, grad_v_in))
    }
}

impl Parameters for MultiHeadAttention {
    fn parameters(&self) -> Vec<&Tensor> {
        [&self.w_q, &self.w_k, &self.w_v, &self.w_o]
            .into_iter()
            .flat_map(Linear::parameters)
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        [&mut self.w_q, &mut self.w_k, &mut self.w_v, &mut self.w_o]
            .into_iter()
            .flat_map(Linear::parameters_mut)
            .collect()
    }
}

/// Set `scores[i][j]` to the mask value for every `j > i`.
fn apply_causal_mask(scores: &mut Tensor) {
    for i in 0..scores.rows() {
        for s in scores.row_mut(i).iter_mut().skip(i + 1) {
            *s = MASK_VALUE;
        }
    }
}

/// Cache for attention backward pass
pub struct AttentionCache {
    pub kind: AttentionKind,
    pub q_cache: LinearCache,
    pub k_cache: LinearCache,
    pub v_cache: LinearCache,
    pub out_cache: LinearCache,
    pub q_heads: Vec<Tensor>,
    pub k_heads: Vec<Tensor>,
    pub v_heads: Vec<Tensor>,
    /// Attention weights per head `[seq_q, seq_kv]`
    pub weights: Vec<Tensor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample(rows: usize, cols: usize, offset: f32) -> Tensor {
        let data = (0..rows * cols)
            .map(|i| (i as f32 * 0.37 + offset).sin())
            .collect();
        Tensor::new(data, vec![rows, cols]).unwrap()
    }

    fn weighted_sum(y: &Tensor, upstream: &Tensor) -> f32 {
        y.data.iter().zip(&upstream.data).map(|(a, b)| a * b).sum()
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let result = MultiHeadAttention::new(3, 10, &mut StdRng::seed_from_u64(0));
        assert!(matches!(result, Err(ViolaError::InvalidConfig(_))));
    }

    #[test]
    fn test_split_merge_heads() {
        let x = sample(3, 8, 0.0);
        let heads = split_heads(&x, 4);
        assert_eq!(heads.len(), 4);
        assert_eq!(heads[2].shape, vec![3, 2]);
        assert_eq!(heads[2].row(1), &x.row(1)[4..6]);
        assert_eq!(merge_heads(&heads), x);
    }

    #[test]
    fn test_causal_mask_zeroes_future() {
        let mha = MultiHeadAttention::new(2, 4, &mut StdRng::seed_from_u64(5)).unwrap();
        let x = sample(4, 4, 1.0);
        let (_, cache) = mha.forward(&x, true).unwrap();
        for weights in &cache.weights {
            for i in 0..4 {
                for j in 0..4 {
                    if j > i {
                        assert_eq!(weights.row(i)[j], 0.0);
                    }
                }
                let sum: f32 = weights.row(i).iter().sum();
                assert!((sum - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_cross_attention_shapes() {
        let mha = MultiHeadAttention::new(2, 4, &mut StdRng::seed_from_u64(5)).unwrap();
        let q_in = sample(2, 4, 0.0);
        let kv_in = sample(5, 4, 2.0);
        let (y, cache) = mha.forward_cross(&q_in, &kv_in).unwrap();
        assert_eq!(y.shape, vec![2, 4]);
        assert_eq!(cache.weights[0].shape, vec![2, 5]);
    }

    #[test]
    fn test_wrong_backward_variant_rejected() {
        let mut mha = MultiHeadAttention::new(2, 4, &mut StdRng::seed_from_u64(5)).unwrap();
        let x = sample(3, 4, 0.0);
        let grad = sample(3, 4, 1.0);

        let (_, self_cache) = mha.forward(&x, false).unwrap();
        assert!(matches!(
            mha.backward_cross(&grad, &self_cache, 0.0),
            Err(ViolaError::InvalidCall(_))
        ));

        let (_, cross_cache) = mha.forward_cross(&x, &x).unwrap();
        assert!(matches!(
            mha.backward(&grad, &cross_cache, 0.0),
            Err(ViolaError::InvalidCall(_))
        ));
    }

    #[test]
    fn test_self_backward_matches_finite_difference() {
        for causal in [false, true] {
            let mha = MultiHeadAttention::new(2, 4, &mut StdRng::seed_from_u64(11)).unwrap();
            let x = sample(3, 4, 0.5);
            let upstream = sample(3, 4, 3.0);

            let h = 1e-3;
            let numeric: Vec<f32> = (0..x.data.len())
                .map(|idx| {
                    let mut plus = x.clone();
                    plus.data[idx] += h;
                    let mut minus = x.clone();
                    minus.data[idx] -= h;
                    let f_plus = weighted_sum(&mha.forward(&plus, causal).unwrap().0, &upstream);
                    let f_minus = weighted_sum(&mha.forward(&minus, causal).unwrap().0, &upstream);
                    (f_plus - f_minus) / (2.0 * h)
                })
                .collect();

            let mut mha = mha;
            let (_, cache) = mha.forward(&x, causal).unwrap();
            let analytic = mha.backward(&upstream, &cache, 0.0).unwrap();
            for (n, a) in numeric.iter().zip(&analytic.data) {
                assert!((n - a).abs() < 1e-2, "causal={}: numeric {} vs analytic {}", causal, n, a);
            }
        }
    }

    #[test]
    fn test_cross_backward_matches_finite_difference() {
        let mha = MultiHeadAttention::new(2, 4, &mut StdRng::seed_from_u64(13)).unwrap();
        let q_in = sample(2, 4, 0.1);
        let kv_in = sample(3, 4, 1.7);
        let upstream = sample(2, 4, 4.2);
        let h = 1e-3;

        let numeric_kv: Vec<f32> = (0..kv_in.data.len())
            .map(|idx| {
                let mut plus = kv_in.clone();
                plus.data[idx] += h;
                let mut minus = kv_in.clone();
                minus.data[idx] -= h;
                let f_plus = weighted_sum(&mha.forward_cross(&q_in, &plus).unwrap().0, &upstream);
                let f_minus = weighted_sum(&mha.forward_cross(&q_in, &minus).unwrap().0, &upstream);
                (f_plus - f_minus) / (2.0 * h)
            })
            .collect();
        let numeric_q: Vec<f32> = (0..q_in.data.len())
            .map(|idx| {
                let mut plus = q_in.clone();
                plus.data[idx] += h;
                let mut minus = q_in.clone();
                minus.data[idx] -= h;
                let f_plus = weighted_sum(&mha.forward_cross(&plus, &kv_in).unwrap().0, &upstream);
                let f_minus = weighted_sum(&mha.forward_cross(&minus, &kv_in).unwrap().0, &upstream);
                (f_plus - f_minus) / (2.0 * h)
            })
            .collect();

        let mut mha = mha;
        let (_, cache) = mha.forward_cross(&q_in, &kv_in).unwrap();
        let (grad_q, grad_kv) = mha.backward_cross(&upstream, &cache, 0.0).unwrap();
        assert_eq!(grad_q.shape, vec![2, 4]);
        assert_eq!(grad_kv.shape, vec![3, 4]);
        for (n, a) in numeric_q.iter().zip(&grad_q.data) {
            assert!((n - a).abs() < 1e-2, "query: numeric {} vs analytic {}", n, a);
        }
        for (n, a) in numeric_kv.iter().zip(&grad_kv.data) {
            assert!((n - a).abs() < 1e-2, "key/value: numeric {} vs analytic {}", n, a);
        }
    }

    #[test]
    fn test_zero_learning_rate_keeps_weights() {
        let mut mha = MultiHeadAttention::new(2, 4, &mut StdRng::seed_from_u64(2)).unwrap();
        let before = mha.w_q.weight.clone();
        let x = sample(3, 4, 0.0);
        let (_, cache) = mha.forward(&x, true).unwrap();
        mha.backward(&sample(3, 4, 1.0), &cache, 0.0).unwrap();
        assert_eq!(mha.w_q.weight, before);
    }
}
