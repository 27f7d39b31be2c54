//! Error types for Viola.
//!
//! Every failure in the forward/backward pipeline is a hard error: the
//! current step is aborted and the caller decides what to do next. Nothing
//! is retried or coerced internally.

use thiserror::Error;

/// Result type alias for Viola operations.
pub type Result<T> = std::result::Result<T, ViolaError>;

/// Errors that can occur while building, running or persisting a model.
#[derive(Error, Debug)]
pub enum ViolaError {
    /// Architecture hyperparameters that cannot describe a model
    /// (e.g. `embedding_dim` not divisible by `num_heads`).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operand shapes disagree with each other or with a component's
    /// configured dimensions.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// An input that must be non-empty was empty.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// A token id outside `[0, vocab_size)`.
    #[error("token id {id} out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { id: usize, vocab_size: usize },

    /// Backward was requested without a preceding forward pass.
    #[error("backward called before forward: {0}")]
    MissingForward(String),

    /// A forward context was handed to the wrong backward variant.
    #[error("invalid call: {0}")]
    InvalidCall(String),

    /// Persisted weights disagree with the configured architecture.
    #[error("weight mismatch: {0}")]
    WeightMismatch(String),

    /// I/O error (including truncated weight files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ViolaError {
    /// Shorthand used by shape checks throughout the layers.
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        ViolaError::ShapeMismatch(msg.into())
    }
}
