//! Neural Network Layers
//!
//! Every component of the encoder-decoder model, each with a hand-written
//! forward and backward pass.
//!
//! ## Layers
//!
//! - **linear**: Affine map, shared by feed-forward, attention and output head
//! - **softmax**: Row softmax and the cross-entropy gradient
//! - **add_norm**: Residual add + layer normalization
//! - **feed_forward**: Linear → ReLU → Linear
//! - **attention**: Multi-head self/masked/cross attention
//! - **embedding**: Token lookup table
//! - **positional**: Sinusoidal position signal
//! - **encoder** / **decoder**: Layers and stacks
//!
//! ## Design Pattern
//!
//! Each trainable layer follows the same pattern:
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn new(...) -> Result<Self> { }
//!     pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Cache)> { }
//!     pub fn backward(&mut self, grad: &Tensor, cache: &Cache, lr: f32) -> Result<Tensor> { }
//! }
//! ```
//!
//! `forward` never mutates the layer; everything backward needs is in the
//! returned cache. `backward` returns the gradient w.r.t. the layer input and
//! applies plain SGD (`param -= lr * grad`) to the layer's own parameters.

pub mod add_norm;
pub mod attention;
pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod feed_forward;
pub mod linear;
pub mod positional;
pub mod softmax;

use crate::tensor::Tensor;

// Re-export main types for convenience
pub use add_norm::{AddNorm, AddNormCache};
pub use attention::{AttentionCache, AttentionKind, MultiHeadAttention};
pub use decoder::{Decoder, DecoderLayer, DecoderLayerCache};
pub use embedding::Embedding;
pub use encoder::{Encoder, EncoderLayer, EncoderLayerCache};
pub use feed_forward::{FeedForward, FeedForwardCache};
pub use linear::{Linear, LinearCache};
pub use positional::PositionalEncoding;
pub use softmax::{Softmax, SoftmaxCache};

/// Ordered access to a component's learnable tensors.
///
/// The order is the order of the weight file.
pub trait Parameters {
    fn parameters(&self) -> Vec<&Tensor>;

    fn parameters_mut(&mut self) -> Vec<&mut Tensor>;

    /// Total number of learnable scalars.
    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|t| t.data.len()).sum()
    }
}
