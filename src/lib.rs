//! Viola: Educational Encoder-Decoder Transformer
//!
//! A sequence-to-sequence transformer written from scratch in Rust, with a
//! hand-derived backward pass for every layer and plain stochastic gradient
//! descent. Named after the twin of *Twelfth Night* who speaks in two voices:
//! an encoder and a decoder.
//!
//! # Modules
//!
//! - [`tensor`] - Row-major matrices and the few operations the model needs
//! - [`layers`] - Linear, softmax, add & norm, feed-forward, attention,
//!   embedding, positional encoding, encoder and decoder stacks
//! - [`transformer`] - The full model: forward, backward, decoding, weight files
//! - [`train`] - Teacher-forced training loop and loss
//! - [`checkpoint`] - Binary weight stream reader/writer
//! - [`config`] - Model and training hyperparameters
//! - [`training_logger`] - Loss history and CSV logging
//!
//! # Example
//!
//! ```rust,no_run
//! use viola::{Config, TrainingConfig, TrainingExample, Transformer, train};
//!
//! let mut model = Transformer::new(&Config::tiny(8))?;
//! let example = TrainingExample::from_pair(vec![3, 4, 5], &[0, 3, 4, 5, 1], 8)?;
//! train(&mut model, &[example], &TrainingConfig::default(), None)?;
//!
//! model.save_weights("copy.bin")?;
//! let decoded = model.greedy_decode(&[3, 4, 5], 0, 1, 10)?;
//! println!("{:?}", decoded);
//! # Ok::<(), viola::ViolaError>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod layers;
pub mod tensor;
pub mod train;
pub mod training_logger;
pub mod transformer;

// Re-export main types for convenience
pub use checkpoint::{WeightReader, WeightWriter};
pub use config::{Config, TrainingConfig};
pub use error::{Result, ViolaError};
pub use layers::Parameters;
pub use tensor::Tensor;
pub use train::{cross_entropy_loss, one_hot_encode, probs_to_tokens, train, TrainingExample};
pub use training_logger::{LossHistory, TrainingLogger};
pub use transformer::Transformer;
