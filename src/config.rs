//! Model and Training Configuration
//!
//! Architecture hyperparameters for the encoder-decoder model, plus the
//! knobs of a plain-SGD training run. Both are `serde` types so a run can be
//! described by a small JSON file and reproduced later.
//!
//! ## Example
//!
//! ```rust
//! use viola::Config;
//!
//! let config = Config::tiny(12);
//! config.validate()?;
//! assert_eq!(config.embedding_dim % config.num_heads, 0);
//! # Ok::<(), viola::ViolaError>(())
//! ```

use crate::error::{Result, ViolaError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Model configuration
///
/// # Fields
///
/// - `vocab_size`: Number of tokens in the (external) vocabulary
/// - `embedding_dim`: Width of every activation row
/// - `num_layers`: Encoder layers, and separately decoder layers
/// - `num_heads`: Attention heads per attention block
/// - `hidden_dim`: Inner width of the feed-forward blocks
/// - `seed`: Seed for weight initialization
///
/// # Parameter Count Formula
///
/// ```text
/// attention     = 4 × embedding_dim²
/// add_norm      = 2 × embedding_dim
/// feed_forward  = 2 × embedding_dim × hidden_dim + hidden_dim + embedding_dim
/// encoder_layer = attention + feed_forward + 2 × add_norm
/// decoder_layer = 2 × attention + feed_forward + 3 × add_norm
/// total = 2 × vocab_size × embedding_dim
///       + num_layers × (encoder_layer + decoder_layer)
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub hidden_dim: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    42
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vocab_size: 1000,
            embedding_dim: 32,
            num_layers: 2,
            num_heads: 4,
            hidden_dim: 64,
            seed: default_seed(),
        }
    }
}

impl Config {
    /// Tiny config used by the toy training run: 32 wide, 2 layers, 4 heads
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            ..Self::default()
        }
    }

    /// Small config for longer experiments
    pub fn small(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            embedding_dim: 64,
            num_layers: 3,
            num_heads: 4,
            hidden_dim: 256,
            seed: default_seed(),
        }
    }

    /// Width of a single attention head.
    pub fn head_dim(&self) -> usize {
        self.embedding_dim / self.num_heads.max(1)
    }

    /// Check that the hyperparameters describe a buildable model.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("embedding_dim", self.embedding_dim),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("hidden_dim", self.hidden_dim),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ViolaError::InvalidConfig(format!("{} must be positive", name)));
            }
            if value > i32::MAX as usize {
                return Err(ViolaError::InvalidConfig(format!(
                    "{} = {} does not fit the weight file format",
                    name, value
                )));
            }
        }
        if self.embedding_dim % self.num_heads != 0 {
            return Err(ViolaError::InvalidConfig(format!(
                "embedding_dim ({}) must be divisible by num_heads ({})",
                self.embedding_dim, self.num_heads
            )));
        }
        Ok(())
    }

    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as pretty-printed JSON.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

/// Hyperparameters of a training run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Plain SGD step size
    pub learning_rate: f32,
    /// Passes over the training examples
    pub num_epochs: usize,
    /// Emit a progress line every this many epochs (0 disables)
    pub log_every: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            num_epochs: 800,
            log_every: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        Config::tiny(10).validate().unwrap();
        Config::small(10).validate().unwrap();
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let config = Config {
            embedding_dim: 10,
            num_heads: 3,
            ..Config::tiny(10)
        };
        assert!(matches!(config.validate(), Err(ViolaError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        for config in [
            Config { vocab_size: 0, ..Config::default() },
            Config { num_layers: 0, ..Config::default() },
            Config { hidden_dim: 0, ..Config::default() },
            Config { num_heads: 0, ..Config::default() },
        ] {
            assert!(config.validate().is_err(), "{:?} should be rejected", config);
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            seed: 7,
            ..Config::small(33)
        };
        config.to_json_file(&path).unwrap();
        assert_eq!(Config::from_json_file(&path).unwrap(), config);
    }

    #[test]
    fn test_seed_defaults_when_missing() {
        let json = r#"{"vocab_size":5,"embedding_dim":4,"num_layers":1,"num_heads":2,"hidden_dim":8}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn test_invalid_json_file_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{"vocab_size":5,"embedding_dim":10,"num_layers":1,"num_heads":3,"hidden_dim":8}"#,
        )
        .unwrap();
        assert!(matches!(
            Config::from_json_file(&path),
            Err(ViolaError::InvalidConfig(_))
        ));
    }
}
