//! Encoder-Decoder Transformer
//!
//! The full model, orchestrating every layer's forward and backward pass.
//!
//! ## Architecture Overview
//!
//! ```text
//! source ids [src_len]                 target ids [tgt_len]
//!     ↓                                     ↓
//! Embedding + PositionalEncoding       Embedding + PositionalEncoding
//!     ↓                                     ↓
//! Encoder (num_layers) ───────────────→ Decoder (num_layers)
//!                      encoder output       ↓
//!                                      Linear → [tgt_len, vocab_size]
//!                                           ↓
//!                                      Softmax → probabilities
//! ```
//!
//! Source and target share one embedding table.
//!
//! ## Backward Pass
//!
//! ```text
//! cross-entropy gradient → softmax → linear → decoder
//!   decoder → (grad target embeddings, grad encoder output)
//!   encoder(grad encoder output) → grad source embeddings
//! embedding scatter: target tokens, then source tokens
//! ```
//!
//! Every layer applies its SGD update as soon as its own gradients are known.
//!
//! ## Example
//!
//! ```rust
//! use viola::{Config, Transformer, one_hot_encode};
//!
//! let config = Config {
//!     vocab_size: 10,
//!     embedding_dim: 4,
//!     num_layers: 1,
//!     num_heads: 2,
//!     hidden_dim: 8,
//!     seed: 0,
//! };
//! let mut model = Transformer::new(&config)?;
//! model.forward_propagation(&[1, 2, 3], &[0, 1])?;
//! assert_eq!(model.get_probabilities().unwrap().shape, vec![2, 10]);
//!
//! let target = one_hot_encode(&[1, 2], 10)?;
//! model.backward_propagation(&target, 0.01)?;
//! # Ok::<(), viola::ViolaError>(())
//! ```

use crate::checkpoint::{WeightReader, WeightWriter};
use crate::config::Config;
use crate::error::{Result, ViolaError};
use crate::layers::{
    Decoder, DecoderLayerCache, Embedding, Encoder, EncoderLayerCache, Linear, LinearCache,
    Parameters, PositionalEncoding, Softmax, SoftmaxCache,
};
use crate::tensor::Tensor;
use crate::train::{cross_entropy_loss, TrainingExample};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Encoder-decoder transformer
pub struct Transformer {
    pub(crate) embedding: Embedding,
    pub(crate) positional_encoding: PositionalEncoding,
    pub(crate) encoder: Encoder,
    pub(crate) decoder: Decoder,
    pub(crate) linear: Linear,
    pub(crate) softmax: Softmax,
    config: Config,
    cache: Option<ForwardCache>,
}

/// Everything the last forward pass produced that backward needs
struct ForwardCache {
    source_ids: Vec<usize>,
    target_ids: Vec<usize>,
    encoder_caches: Vec<EncoderLayerCache>,
    decoder_caches: Vec<DecoderLayerCache>,
    linear_cache: LinearCache,
    softmax_cache: SoftmaxCache,
}

impl Transformer {
    /// Build a model with weights drawn from a generator seeded by
    /// `config.seed`.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let embedding = Embedding::new(config.vocab_size, config.embedding_dim, &mut rng)?;
        let encoder = Encoder::new(config, &mut rng)?;
        let decoder = Decoder::new(config, &mut rng)?;
        let linear = Linear::new(
            config.embedding_dim,
            config.vocab_size,
            false,
            1.0 / (config.embedding_dim as f32).sqrt(),
            &mut rng,
        )?;

        let model = Self {
            embedding,
            positional_encoding: PositionalEncoding::new(config.embedding_dim),
            encoder,
            decoder,
            linear,
            softmax: Softmax::new(),
            config: config.clone(),
            cache: None,
        };
        tracing::debug!(parameters = model.parameter_count(), "built transformer");
        Ok(model)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the full model on one source/target pair.
    ///
    /// Replaces any cache left by a previous forward pass.
    pub fn forward_propagation(
        &mut self,
        source_ids: &[usize],
        target_ids: &[usize],
    ) -> Result<()> {
        self.cache = None;

        let source_embedded = self.positional_encoding.apply(&self.embedding.forward(source_ids)?)?;
        let target_embedded = self.positional_encoding.apply(&self.embedding.forward(target_ids)?)?;

        let (encoder_output, encoder_caches) = self.encoder.forward(&source_embedded)?;
        let (decoder_output, decoder_caches) =
            self.decoder.forward(&target_embedded, &encoder_output)?;

        let (logits, linear_cache) = self.linear.forward(&decoder_output)?;
        let (_, softmax_cache) = self.softmax.forward(&logits)?;

        tracing::trace!(
            source_len = source_ids.len(),
            target_len = target_ids.len(),
            "forward pass"
        );

        self.cache = Some(ForwardCache {
            source_ids: source_ids.to_vec(),
            target_ids: target_ids.to_vec(),
            encoder_caches,
            decoder_caches,
            linear_cache,
            softmax_cache,
        });
        Ok(())
    }

    /// Probabilities `[target_len, vocab_size]` of the last forward pass.
    pub fn get_probabilities(&self) -> Option<&Tensor> {
        self.cache.as_ref().map(|c| &c.softmax_cache.probs)
    }

    /// Backpropagate the cross-entropy loss against `target_one_hot` and
    /// update every parameter with step size `learning_rate`.
    ///
    /// Consumes the forward cache; a second call without a new forward
    /// pass fails with `MissingForward`.
    pub fn backward_propagation(
        &mut self,
        target_one_hot: &Tensor,
        learning_rate: f32,
    ) -> Result<()> {
        let cache = self.cache.take().ok_or_else(|| {
            ViolaError::MissingForward("no forward pass to backpropagate through".into())
        })?;
        target_one_hot.ensure_shape(
            &[cache.target_ids.len(), self.config.vocab_size],
            "one-hot target",
        )?;

        let d_p = self.softmax.grad_output_model(target_one_hot, &cache.softmax_cache)?;
        let grad_logits = self.softmax.backward(&d_p, &cache.softmax_cache)?;
        let grad_decoder_output =
            self.linear
                .backward(&grad_logits, &cache.linear_cache, learning_rate)?;

        let (grad_target, grad_encoder_output) =
            self.decoder
                .backward(&grad_decoder_output, &cache.decoder_caches, learning_rate)?;
        let grad_source =
            self.encoder
                .backward(&grad_encoder_output, &cache.encoder_caches, learning_rate)?;

        // The positional signal is a constant, so its gradient passes through unchanged
        self.embedding.backward(&cache.target_ids, &grad_target, learning_rate)?;
        self.embedding.backward(&cache.source_ids, &grad_source, learning_rate)?;

        tracing::trace!(learning_rate, "backward pass");
        Ok(())
    }

    /// Forward, loss, backward on one example. Returns the loss of the
    /// forward pass (before the update).
    pub fn train_step(&mut self, example: &TrainingExample, learning_rate: f32) -> Result<f32> {
        self.forward_propagation(&example.source, &example.decoder_input)?;
        let probs = self
            .get_probabilities()
            .ok_or_else(|| ViolaError::MissingForward("forward pass produced no output".into()))?;
        let loss = cross_entropy_loss(probs, &example.target_one_hot)?;
        self.backward_propagation(&example.target_one_hot, learning_rate)?;
        tracing::debug!(loss, "train step");
        Ok(loss)
    }

    /// Greedy autoregressive decoding.
    ///
    /// Starts from `[bos_id]`, repeatedly runs the model and appends the most
    /// probable next token. Stops when `eos_id` is produced (not included) or
    /// after `max_steps` tokens. The returned ids exclude the leading BOS.
    pub fn greedy_decode(
        &mut self,
        source_ids: &[usize],
        bos_id: usize,
        eos_id: usize,
        max_steps: usize,
    ) -> Result<Vec<usize>> {
        let mut tokens = vec![bos_id];
        for _ in 0..max_steps {
            self.forward_propagation(source_ids, &tokens)?;
            let next = self
                .get_probabilities()
                .and_then(|probs| probs.argmax_rows().last().copied())
                .ok_or_else(|| {
                    ViolaError::MissingForward("forward pass produced no output".into())
                })?;
            if next == eos_id {
                break;
            }
            tokens.push(next);
        }
        self.cache = None;
        Ok(tokens.split_off(1))
    }

    /// Write all weights in the fixed parameter order.
    pub fn write_weights<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = WeightWriter::new(writer);
        for param in self.parameters() {
            writer.write_tensor(param)?;
        }
        writer.flush()
    }

    /// Read all weights in the fixed parameter order.
    ///
    /// Every shape is validated against the configuration and the model is
    /// only modified once the whole stream has been read.
    pub fn read_weights<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut reader = WeightReader::new(reader);
        let mut loaded = Vec::new();
        for (index, param) in self.parameters().into_iter().enumerate() {
            let what = format!("parameter {}", index);
            loaded.push(reader.read_tensor(&param.shape, &what)?);
        }
        reader.finish()?;

        for (param, value) in self.parameters_mut().into_iter().zip(loaded) {
            *param = value;
        }
        self.cache = None;
        Ok(())
    }

    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.write_weights(BufWriter::new(File::create(path)?))?;
        tracing::info!(
            path = %path.display(),
            parameters = self.parameter_count(),
            "saved weights"
        );
        Ok(())
    }

    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.read_weights(BufReader::new(File::open(path)?))?;
        tracing::info!(path = %path.display(), "loaded weights");
        Ok(())
    }
}

impl Parameters for Transformer {
    /// Embedding, encoder layers, decoder layers, output projection
    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.embedding.parameters();
        params.extend(self.encoder.parameters());
        params.extend(self.decoder.parameters());
        params.extend(self.linear.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.embedding.parameters_mut();
        params.extend(self.encoder.parameters_mut());
        params.extend(self.decoder.parameters_mut());
        params.extend(self.linear.parameters_mut());
        params
    }
}
