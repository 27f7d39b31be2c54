//! Train the encoder-decoder model on a toy translation pair
//!
//! This example demonstrates:
//! - Building a word-level vocabulary with `<BOS>`/`<EOS>` markers
//! - Teacher-forced training with plain SGD and a CSV loss log
//! - Saving weights, reloading them into a fresh model
//! - Greedy decoding of the source sentence
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example train_copy
//! cargo run --release --example train_copy -- --epochs 400 --lr 0.02
//! RUST_LOG=viola=debug cargo run --release --example train_copy
//! ```
//!
//! # Expected Runtime
//!
//! A few seconds for the default 800 epochs.

use clap::Parser;
use std::collections::BTreeMap;
use tracing_subscriber::EnvFilter;
use viola::{
    train, Config, Parameters, TrainingConfig, TrainingExample, TrainingLogger, Transformer,
};

const SOURCE_TEXT: &str = "the cat sat on the mat";
const TARGET_TEXT: &str = "le chat est assis sur le tapis";

#[derive(Parser)]
#[command(name = "train_copy", about = "Train a tiny transformer on one sentence pair")]
struct Args {
    /// Training epochs
    #[arg(long, default_value = "800")]
    epochs: usize,

    /// SGD learning rate
    #[arg(long, default_value = "0.01")]
    lr: f32,

    /// Log the loss every N epochs
    #[arg(long, default_value = "50")]
    log_every: usize,

    /// Seed for weight initialization
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Where to write the trained weights
    #[arg(long, default_value = "viola_weights.bin")]
    weights: String,

    /// Where to write the per-epoch loss CSV
    #[arg(long, default_value = "viola_training.csv")]
    log_csv: String,
}

/// Word-level vocabulary with the special tokens first
struct Vocab {
    ids: BTreeMap<String, usize>,
    words: Vec<String>,
}

impl Vocab {
    fn build(texts: &[&str]) -> Self {
        let mut vocab = Self {
            ids: BTreeMap::new(),
            words: Vec::new(),
        };
        for special in ["<BOS>", "<EOS>"] {
            vocab.insert(special);
        }
        for text in texts {
            for word in text.split_whitespace() {
                vocab.insert(word);
            }
        }
        vocab
    }

    fn insert(&mut self, word: &str) {
        if !self.ids.contains_key(word) {
            self.ids.insert(word.to_string(), self.words.len());
            self.words.push(word.to_string());
        }
    }

    fn id(&self, word: &str) -> usize {
        self.ids[word]
    }

    fn encode(&self, text: &str) -> Vec<usize> {
        text.split_whitespace().map(|w| self.id(w)).collect()
    }

    fn decode(&self, ids: &[usize]) -> String {
        ids.iter()
            .map(|&id| self.words.get(id).map(String::as_str).unwrap_or("<UNK>"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn len(&self) -> usize {
        self.words.len()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("viola=info")),
        )
        .init();

    let args = Args::parse();

    println!("\n{}", "=".repeat(70));
    println!("  Encoder-Decoder Training: One Sentence Pair");
    println!("{}", "=".repeat(70));

    let vocab = Vocab::build(&[SOURCE_TEXT, TARGET_TEXT]);
    let bos = vocab.id("<BOS>");
    let eos = vocab.id("<EOS>");

    let source = vocab.encode(SOURCE_TEXT);
    let mut full_target = vec![bos];
    full_target.extend(vocab.encode(TARGET_TEXT));
    full_target.push(eos);

    println!("\nVocabulary: {} tokens", vocab.len());
    println!("Source:     {:?}", source);
    println!("Target:     {:?}", full_target);

    let config = Config {
        seed: args.seed,
        ..Config::tiny(vocab.len())
    };
    let mut model = Transformer::new(&config)?;
    println!(
        "\nModel: {} layers, {} heads, width {}, hidden {} ({} parameters)",
        config.num_layers,
        config.num_heads,
        config.embedding_dim,
        config.hidden_dim,
        model.parameter_count()
    );

    let example = TrainingExample::from_pair(source.clone(), &full_target, vocab.len())?;
    let training = TrainingConfig {
        learning_rate: args.lr,
        num_epochs: args.epochs,
        log_every: args.log_every,
    };

    println!("\n{}", "─".repeat(70));
    println!("Training for {} epochs at lr {}", training.num_epochs, training.learning_rate);
    println!("{}", "─".repeat(70));

    let mut logger = TrainingLogger::new(&args.log_csv)?;
    let history = train(&mut model, &[example], &training, Some(&mut logger))?;
    if let (Some(first), Some(last)) = (history.losses().first(), history.last()) {
        println!("\nLoss: {:.4} → {:.4}", first, last);
    }
    println!("Loss log written to {}", args.log_csv);

    model.save_weights(&args.weights)?;
    println!("Weights written to {}", args.weights);

    println!("\n{}", "─".repeat(70));
    println!("Reloading weights into a fresh model");
    println!("{}", "─".repeat(70));

    let mut restored = Transformer::new(&Config {
        seed: args.seed.wrapping_add(1),
        ..config
    })?;
    restored.load_weights(&args.weights)?;

    let decoded = restored.greedy_decode(&source, bos, eos, full_target.len() + 5)?;
    println!("\nInput:   {}", SOURCE_TEXT);
    println!("Output:  {}", vocab.decode(&decoded));
    println!("Expected: {}\n", TARGET_TEXT);

    Ok(())
}
