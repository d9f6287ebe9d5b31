//! Training loop for WGAN-GP
//!
//! Each epoch runs several critic updates followed by one generator update.
//! Every 100th epoch the critic gets 5 updates regardless of `n_critic`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::metrics::CriticLoss;
use crate::data::BatchSource;
use crate::model::WganGp;
use crate::utils::checkpoint::create_run_folder;

/// WGAN-GP training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WganTrainingConfig {
    /// Number of epochs to run, counted from the model's current epoch
    pub epochs: usize,
    /// Folder receiving samples, weights and state
    pub run_folder: PathBuf,
    /// Sample images and save weights every N epochs
    pub print_every_n_batches: usize,
    /// Critic updates per generator update
    pub n_critic: usize,
    /// Serve real images from a shuffling loader instead of random indices
    pub using_generator: bool,
}

impl Default for WganTrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 6000,
            run_folder: PathBuf::from("run/wgangp"),
            print_every_n_batches: 10,
            n_critic: 5,
            using_generator: false,
        }
    }
}

/// Critic updates to run in a given epoch
pub fn critic_loops(epoch: usize, n_critic: usize) -> usize {
    if epoch % 100 == 0 {
        5
    } else {
        n_critic
    }
}

/// WGAN-GP trainer
pub struct WganTrainer {
    config: WganTrainingConfig,
}

impl WganTrainer {
    pub fn new(config: WganTrainingConfig) -> Self {
        Self { config }
    }

    /// Train `model` for `config.epochs` epochs, continuing from `model.epoch`
    pub fn train(&mut self, model: &mut WganGp, batches: &mut dyn BatchSource) -> anyhow::Result<()> {
        let batch_size = model.config().batch_size;
        let run_folder = &self.config.run_folder;
        create_run_folder(run_folder)?;

        let start = model.epoch;
        info!(
            "Training WGAN-GP for epochs {}..{} with batch size {}",
            start,
            start + self.config.epochs,
            batch_size
        );

        for epoch in start..start + self.config.epochs {
            let loops = critic_loops(epoch, self.config.n_critic);

            let mut d_loss = CriticLoss::default();
            for _ in 0..loops {
                d_loss = model.train_critic(batches, batch_size)?;
            }

            let g_loss = model.train_generator(batch_size);

            info!(
                "{} ({}, {}) [D loss: ({:.1})(R {:.1}, F {:.1})] [G loss: {:.1}]",
                epoch, loops, 1, d_loss.total, d_loss.real, d_loss.fake, g_loss
            );

            model.metrics.record(d_loss, g_loss);

            if self.config.print_every_n_batches > 0
                && epoch % self.config.print_every_n_batches == 0
            {
                model.sample_images(run_folder)?;

                let weights = run_folder.join("weights");
                model.save_weights(weights.join(format!("epoch_{:04}", epoch)))?;
                model.save_weights(weights.join("latest"))?;
                model.save_model(run_folder)?;
            }

            model.epoch += 1;
        }

        let metrics_path = run_folder.join("training_metrics.csv");
        model.metrics.save_csv(&metrics_path.to_string_lossy())?;

        Ok(())
    }

    /// Get configuration
    pub fn config(&self) -> &WganTrainingConfig {
        &self.config
    }
}
