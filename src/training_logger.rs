//! Training Logger
//!
//! Two ways to keep track of a run:
//!
//! - **LossHistory**: In-memory per-epoch losses (what a live loss plot
//!   would consume)
//! - **TrainingLogger**: CSV file with one row per epoch
//!
//! ## CSV Format
//!
//! - `epoch`: Epoch number (1-based)
//! - `elapsed_seconds`: Time since the logger was created
//! - `learning_rate`: SGD step size
//! - `loss`: Mean cross-entropy over the epoch
//! - `perplexity`: exp(loss)
//!
//! ## Perplexity
//!
//! ```text
//! perplexity = exp(loss)
//! ```
//!
//! A perfect model has perplexity 1; uniform guessing over a vocabulary of
//! size V has perplexity V.

use crate::error::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// Per-epoch loss values in order
#[derive(Clone, Debug, Default)]
pub struct LossHistory {
    losses: Vec<f32>,
}

impl LossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, loss: f32) {
        self.losses.push(loss);
    }

    pub fn losses(&self) -> &[f32] {
        &self.losses
    }

    pub fn last(&self) -> Option<f32> {
        self.losses.last().copied()
    }

    /// Smallest finite loss seen so far.
    pub fn best(&self) -> Option<f32> {
        self.losses
            .iter()
            .copied()
            .filter(|l| l.is_finite())
            .reduce(f32::min)
    }
}

/// CSV logger for training metrics
///
/// Every row is flushed immediately so an interrupted run keeps its log.
pub struct TrainingLogger {
    log_file: BufWriter<File>,
    start_time: Instant,
}

impl TrainingLogger {
    /// Create the CSV file and write its header.
    pub fn new(log_path: impl AsRef<Path>) -> Result<Self> {
        let mut log_file = BufWriter::new(File::create(log_path)?);
        writeln!(log_file, "epoch,elapsed_seconds,learning_rate,loss,perplexity")?;
        log_file.flush()?;

        Ok(Self {
            log_file,
            start_time: Instant::now(),
        })
    }

    /// Append one epoch's metrics.
    pub fn log(&mut self, epoch: usize, learning_rate: f32, loss: f32) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let perplexity = loss.exp();

        writeln!(
            self.log_file,
            "{},{:.2},{:.6},{:.4},{:.2}",
            epoch, elapsed, learning_rate, loss, perplexity
        )?;
        self.log_file.flush()?;

        tracing::debug!(epoch, loss, perplexity, elapsed, "logged epoch");
        Ok(())
    }
}
