//! Training Utilities
//!
//! Helpers for teacher-forced sequence-to-sequence training with plain SGD.
//!
//! ## Teacher Forcing
//!
//! A training pair is a source sequence and a full target sequence framed by
//! BOS/EOS. The decoder sees the target without its last token and learns to
//! predict the target without its first token:
//!
//! ```text
//! full target:    [BOS, a, b, c, EOS]
//! decoder input:  [BOS, a, b, c]
//! labels:         [a, b, c, EOS]
//! ```
//!
//! ## Example
//!
//! ```rust
//! use viola::{Config, Transformer, TrainingConfig, TrainingExample, train};
//!
//! let mut model = Transformer::new(&Config {
//!     vocab_size: 6,
//!     embedding_dim: 8,
//!     num_layers: 1,
//!     num_heads: 2,
//!     hidden_dim: 16,
//!     seed: 1,
//! })?;
//! let example = TrainingExample::from_pair(vec![2, 3], &[0, 4, 5, 1], 6)?;
//! let config = TrainingConfig { learning_rate: 0.05, num_epochs: 5, log_every: 0 };
//! let history = train(&mut model, &[example], &config, None)?;
//! assert_eq!(history.losses().len(), 5);
//! # Ok::<(), viola::ViolaError>(())
//! ```

use crate::config::TrainingConfig;
use crate::error::{Result, ViolaError};
use crate::tensor::Tensor;
use crate::training_logger::{LossHistory, TrainingLogger};
use crate::transformer::Transformer;

/// Lower bound on a probability before taking its logarithm.
const LOG_CLAMP: f32 = 1e-7;

/// One-hot matrix `[len, vocab_size]` for a token sequence.
pub fn one_hot_encode(token_ids: &[usize], vocab_size: usize) -> Result<Tensor> {
    if token_ids.is_empty() {
        return Err(ViolaError::EmptyInput("cannot one-hot encode an empty sequence".into()));
    }
    let mut one_hot = Tensor::zeros(token_ids.len(), vocab_size);
    for (i, &id) in token_ids.iter().enumerate() {
        if id >= vocab_size {
            return Err(ViolaError::TokenOutOfRange { id, vocab_size });
        }
        one_hot.row_mut(i)[id] = 1.0;
    }
    Ok(one_hot)
}

/// Most probable token id of every row.
pub fn probs_to_tokens(probs: &Tensor) -> Result<Vec<usize>> {
    if probs.shape.len() != 2 || probs.data.is_empty() {
        return Err(ViolaError::EmptyInput(format!(
            "probability matrix must be non-empty, got {:?}",
            probs.shape
        )));
    }
    Ok(probs.argmax_rows())
}

/// Mean cross-entropy over rows.
///
/// ```text
/// loss = -(1/rows) × Σ_i Σ_j t[i][j] × ln(max(p[i][j], 1e-7))
/// ```
pub fn cross_entropy_loss(probs: &Tensor, target_one_hot: &Tensor) -> Result<f32> {
    if probs.shape != target_one_hot.shape {
        return Err(ViolaError::shape(format!(
            "probabilities {:?} do not match target {:?}",
            probs.shape, target_one_hot.shape
        )));
    }
    let rows = probs.rows();
    if rows == 0 {
        return Err(ViolaError::EmptyInput("no rows to compute a loss over".into()));
    }
    let total: f32 = probs
        .data
        .iter()
        .zip(&target_one_hot.data)
        .filter(|(_, t)| **t != 0.0)
        .map(|(&p, &t)| -t * p.max(LOG_CLAMP).ln())
        .sum();
    Ok(total / rows as f32)
}

/// A teacher-forced training pair
#[derive(Clone, Debug)]
pub struct TrainingExample {
    pub source: Vec<usize>,
    pub decoder_input: Vec<usize>,
    pub labels: Vec<usize>,
    pub target_one_hot: Tensor,
}

impl TrainingExample {
    /// Build an example from a source sequence and a BOS/EOS-framed target.
    ///
    /// The full target needs at least two tokens.
    pub fn from_pair(source: Vec<usize>, full_target: &[usize], vocab_size: usize) -> Result<Self> {
        if source.is_empty() {
            return Err(ViolaError::EmptyInput("source sequence is empty".into()));
        }
        if full_target.len() < 2 {
            return Err(ViolaError::EmptyInput(format!(
                "target needs at least two tokens, got {}",
                full_target.len()
            )));
        }
        if let Some(&id) = source.iter().find(|&&id| id >= vocab_size) {
            return Err(ViolaError::TokenOutOfRange { id, vocab_size });
        }
        let decoder_input = full_target[..full_target.len() - 1].to_vec();
        let labels = full_target[1..].to_vec();
        let target_one_hot = one_hot_encode(&labels, vocab_size)?;
        Ok(Self {
            source,
            decoder_input,
            labels,
            target_one_hot,
        })
    }
}

/// Train for `config.num_epochs` passes over `examples`.
///
/// Each epoch's loss is the mean of the per-example losses measured before
/// each update. Non-finite losses are reported but do not stop training.
pub fn train(
    model: &mut Transformer,
    examples: &[TrainingExample],
    config: &TrainingConfig,
    mut logger: Option<&mut TrainingLogger>,
) -> Result<LossHistory> {
    if examples.is_empty() {
        return Err(ViolaError::EmptyInput("no training examples".into()));
    }

    let mut history = LossHistory::new();
    for epoch in 1..=config.num_epochs {
        let mut total = 0.0;
        for example in examples {
            total += model.train_step(example, config.learning_rate)?;
        }
        let loss = total / examples.len() as f32;

        if !loss.is_finite() {
            tracing::warn!(epoch, loss, "non-finite training loss");
        }
        history.record(loss);

        if let Some(logger) = logger.as_deref_mut() {
            logger.log(epoch, config.learning_rate, loss)?;
        }
        if config.log_every > 0 && (epoch % config.log_every == 0 || epoch == config.num_epochs) {
            tracing::info!(
                epoch,
                loss,
                perplexity = loss.exp(),
                "epoch {}/{}",
                epoch,
                config.num_epochs
            );
        }
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_one_hot() {
        let t = one_hot_encode(&[2, 0], 3).unwrap();
        assert_eq!(t.data, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
        assert!(matches!(
            one_hot_encode(&[3], 3),
            Err(ViolaError::TokenOutOfRange { id: 3, vocab_size: 3 })
        ));
        assert!(one_hot_encode(&[], 3).is_err());
    }

    #[test]
    fn test_probs_to_tokens() {
        let p = Tensor::from_rows(&[vec![0.1, 0.9], vec![0.6, 0.4]]).unwrap();
        assert_eq!(probs_to_tokens(&p).unwrap(), vec![1, 0]);
        assert!(probs_to_tokens(&Tensor::zeros(0, 2)).is_err());
    }

    #[test]
    fn test_cross_entropy() {
        let p = Tensor::from_rows(&[vec![0.5, 0.5], vec![0.25, 0.75]]).unwrap();
        let t = one_hot_encode(&[0, 1], 2).unwrap();
        let expected = -(0.5f32.ln() + 0.75f32.ln()) / 2.0;
        assert!((cross_entropy_loss(&p, &t).unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_clamps_zero_probability() {
        let p = Tensor::from_rows(&[vec![0.0, 1.0]]).unwrap();
        let t = one_hot_encode(&[0], 2).unwrap();
        let loss = cross_entropy_loss(&p, &t).unwrap();
        assert!((loss - (-(1e-7f32).ln())).abs() < 1e-3);
    }

    #[test]
    fn test_example_shifts_target() {
        let ex = TrainingExample::from_pair(vec![4, 5], &[0, 2, 3, 1], 6).unwrap();
        assert_eq!(ex.decoder_input, vec![0, 2, 3]);
        assert_eq!(ex.labels, vec![2, 3, 1]);
        assert_eq!(ex.target_one_hot.shape, vec![3, 6]);
        assert!(TrainingExample::from_pair(vec![4], &[0], 6).is_err());
        assert!(TrainingExample::from_pair(vec![9], &[0, 1], 6).is_err());
    }

    #[test]
    fn test_loss_decreases() {
        let config = Config {
            vocab_size: 8,
            embedding_dim: 8,
            num_layers: 1,
            num_heads: 2,
            hidden_dim: 16,
            seed: 3,
        };
        let mut model = Transformer::new(&config).unwrap();
        let example = TrainingExample::from_pair(vec![3, 4, 5], &[0, 5, 4, 3, 1], 8).unwrap();
        let training = TrainingConfig {
            learning_rate: 0.05,
            num_epochs: 60,
            log_every: 0,
        };
        let history = train(&mut model, &[example], &training, None).unwrap();
        let losses = history.losses();
        assert_eq!(losses.len(), 60);
        assert!(losses.iter().all(|l| l.is_finite()));
        assert!(
            losses[59] < losses[0],
            "loss did not decrease: {} -> {}",
            losses[0],
            losses[59]
        );
    }

    #[test]
    fn test_no_examples() {
        let mut model = Transformer::new(&Config::tiny(5)).unwrap();
        assert!(train(&mut model, &[], &TrainingConfig::default(), None).is_err());
    }
}
