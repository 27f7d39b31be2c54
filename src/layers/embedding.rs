//! Token Embedding
//!
//! A `[vocab_size, embedding_dim]` lookup table: row `t` is the vector for
//! token id `t`. Initialized from `Normal(0, 0.01)`.
//!
//! The backward pass is a sparse scatter: only the rows of tokens that
//! appeared in the sequence receive an update. Positions that share a token
//! id have their gradients summed before the step.

use super::linear::normal_init;
use super::Parameters;
use crate::error::{Result, ViolaError};
use crate::tensor::Tensor;
use rand::Rng;
use std::collections::BTreeMap;

/// Token embedding table
pub struct Embedding {
    pub weight: Tensor,
}

impl Embedding {
    pub fn new<R: Rng + ?Sized>(
        vocab_size: usize,
        embedding_dim: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if vocab_size == 0 || embedding_dim == 0 {
            return Err(ViolaError::InvalidConfig(format!(
                "embedding needs positive sizes, got {}x{}",
                vocab_size, embedding_dim
            )));
        }
        Ok(Self {
            weight: normal_init(vocab_size, embedding_dim, 0.01, rng)?,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.weight.shape[1]
    }

    fn check_ids(&self, token_ids: &[usize]) -> Result<()> {
        if token_ids.is_empty() {
            return Err(ViolaError::EmptyInput("token sequence is empty".into()));
        }
        let vocab_size = self.vocab_size();
        match token_ids.iter().find(|&&id| id >= vocab_size) {
            Some(&id) => Err(ViolaError::TokenOutOfRange { id, vocab_size }),
            None => Ok(()),
        }
    }

    /// Look up one row per token id: `[len, embedding_dim]`.
    pub fn forward(&self, token_ids: &[usize]) -> Result<Tensor> {
        self.check_ids(token_ids)?;
        let mut data = Vec::with_capacity(token_ids.len() * self.embedding_dim());
        for &id in token_ids {
            data.extend_from_slice(self.weight.row(id));
        }
        Tensor::new(data, vec![token_ids.len(), self.embedding_dim()])
    }

    /// Apply `row -= lr * grad` to the rows of the given tokens.
    ///
    /// Every id is checked before any row changes.
    pub fn backward(&mut self, token_ids: &[usize], grad: &Tensor, lr: f32) -> Result<()> {
        self.check_ids(token_ids)?;
        grad.ensure_shape(&[token_ids.len(), self.embedding_dim()], "embedding gradient")?;

        let dim = self.embedding_dim();
        let mut accumulated: BTreeMap<usize, Vec<f32>> = BTreeMap::new();
        for (pos, &id) in token_ids.iter().enumerate() {
            let acc = accumulated.entry(id).or_insert_with(|| vec![0.0; dim]);
            for (a, g) in acc.iter_mut().zip(grad.row(pos)) {
                *a += g;
            }
        }

        for (id, acc) in accumulated {
            for (w, g) in self.weight.row_mut(id).iter_mut().zip(&acc) {
                *w -= lr * g;
            }
        }
        Ok(())
    }
}

impl Parameters for Embedding {
    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn table() -> Embedding {
        let mut emb = Embedding::new(3, 2, &mut StdRng::seed_from_u64(0)).unwrap();
        emb.weight =
            Tensor::from_rows(&[vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]]).unwrap();
        emb
    }

    #[test]
    fn test_lookup() {
        let out = table().forward(&[2, 0, 2]).unwrap();
        assert_eq!(out.data, vec![2.0, 2.0, 0.0, 0.0, 2.0, 2.0]);
    }

    #[test]
    fn test_out_of_range_token() {
        let err = table().forward(&[0, 3]).unwrap_err();
        assert!(matches!(err, ViolaError::TokenOutOfRange { id: 3, vocab_size: 3 }));
    }

    #[test]
    fn test_empty_sequence() {
        assert!(matches!(table().forward(&[]), Err(ViolaError::EmptyInput(_))));
    }

    #[test]
    fn test_repeated_ids_accumulate() {
        let mut emb = table();
        let grad = Tensor::from_rows(&[vec![1.0, 0.0], vec![1.0, 2.0], vec![0.5, 0.5]]).unwrap();
        emb.backward(&[1, 1, 2], &grad, 0.5).unwrap();
        assert_eq!(emb.weight.row(0), &[0.0, 0.0]);
        assert_eq!(emb.weight.row(1), &[0.0, 0.0]);
        assert_eq!(emb.weight.row(2), &[1.75, 1.75]);
    }

    #[test]
    fn test_bad_id_leaves_table_untouched() {
        let mut emb = table();
        let before = emb.weight.clone();
        let grad = Tensor::from_rows(&[vec![1.0, 1.0], vec![1.0, 1.0]]).unwrap();
        assert!(emb.backward(&[1, 7], &grad, 1.0).is_err());
        assert_eq!(emb.weight, before);
    }

    #[test]
    fn test_gradient_length_mismatch() {
        let mut emb = table();
        let grad = Tensor::zeros(1, 2);
        assert!(matches!(
            emb.backward(&[0, 1], &grad, 1.0),
            Err(ViolaError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_init_scale() {
        let emb = Embedding::new(200, 50, &mut StdRng::seed_from_u64(9)).unwrap();
        let n = emb.weight.data.len() as f32;
        let mean = emb.weight.data.iter().sum::<f32>() / n;
        let var = emb.weight.data.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 1e-3);
        assert!((var.sqrt() - 0.01).abs() < 1e-3);
    }
}
