//! Training loop for the autoencoder
//!
//! Fits the model to reconstruct its own input, with a step-decay learning
//! rate, per-epoch weight checkpoints and periodic loss logging.

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tch::{Device, Tensor};
use tracing::{debug, info};

use super::losses::reconstruction_loss;
use super::metrics::AutoencoderMetrics;
use super::schedule::step_decay_schedule;
use crate::data::DataLoader;
use crate::model::Autoencoder;
use crate::utils::checkpoint::create_run_folder;

/// Autoencoder training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoencoderTrainingConfig {
    /// Learning rate handed to `compile`
    pub learning_rate: f64,
    pub batch_size: usize,
    /// Index one past the last epoch to run
    pub epochs: usize,
    /// Folder receiving weights and metrics
    pub run_folder: PathBuf,
    /// Log the loss every N epochs
    pub print_every_n_batches: usize,
    /// First epoch to run (for resumed training)
    pub initial_epoch: usize,
    /// Learning rate multiplier applied every epoch
    pub lr_decay: f64,
}

impl Default for AutoencoderTrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.0005,
            batch_size: 32,
            epochs: 200,
            run_folder: PathBuf::from("run/autoencoder"),
            print_every_n_batches: 100,
            initial_epoch: 0,
            lr_decay: 1.0,
        }
    }
}

/// Autoencoder trainer
pub struct AutoencoderTrainer {
    config: AutoencoderTrainingConfig,
    device: Device,
    metrics: AutoencoderMetrics,
}

impl AutoencoderTrainer {
    pub fn new(config: AutoencoderTrainingConfig, device: Device) -> Self {
        Self {
            config,
            device,
            metrics: AutoencoderMetrics::new(),
        }
    }

    /// Train a compiled autoencoder on `x_train` (shape [N, C, H, W])
    ///
    /// Runs epochs `initial_epoch..epochs`; the learning rate of each epoch
    /// comes from the step-decay schedule based on the compiled rate.
    pub fn train(
        &mut self,
        model: &mut Autoencoder,
        x_train: &Tensor,
    ) -> anyhow::Result<&AutoencoderMetrics> {
        let initial_lr = model
            .learning_rate()
            .ok_or_else(|| anyhow::anyhow!("Model must be compiled before training"))?;
        if self.config.batch_size == 0 {
            anyhow::bail!("Batch size must be > 0");
        }
        let expected = model.config().input_dim.dims();
        if x_train.dim() != 4 || x_train.size()[1..] != expected {
            anyhow::bail!(
                "Training data shape {:?} does not match model input {}",
                x_train.size(),
                model.config().input_dim
            );
        }
        if x_train.size()[0] == 0 {
            anyhow::bail!("Training data is empty");
        }

        let run_folder = &self.config.run_folder;
        create_run_folder(run_folder)?;
        let checkpoint_path = run_folder.join("weights").join("weights.ot");

        let schedule = step_decay_schedule(initial_lr, self.config.lr_decay, 1);
        let mut data_loader =
            DataLoader::new(x_train.shallow_clone(), self.config.batch_size, true, false);
        let num_samples = data_loader.num_samples() as f64;

        info!(
            "Training autoencoder for epochs {}..{}, {} batches per epoch",
            self.config.initial_epoch,
            self.config.epochs,
            data_loader.num_batches()
        );

        for epoch in self.config.initial_epoch..self.config.epochs {
            let lr = schedule.learning_rate(epoch);
            model.set_learning_rate(lr)?;
            debug!("Epoch {}: learning rate {:.6}", epoch, lr);

            let pb = ProgressBar::new(data_loader.num_batches() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
                    .progress_chars("##-"),
            );

            let mut epoch_loss = 0.0;
            for batch in data_loader.iter() {
                let batch = batch.to_device(self.device);
                let batch_len = batch.size()[0] as f64;

                let reconstruction = model.forward_t(&batch, true);
                let loss = reconstruction_loss(&batch, &reconstruction);
                model.backward_step(&loss)?;

                let loss = loss.double_value(&[]);
                epoch_loss += loss * batch_len;

                pb.set_message(format!("loss: {:.4}", loss));
                pb.inc(1);
            }
            pb.finish_and_clear();

            let avg_loss = epoch_loss / num_samples;
            self.metrics.record_epoch(epoch, avg_loss, lr);

            model.save_weights(&checkpoint_path)?;
            debug!("Epoch {}: saved weights to {}", epoch, checkpoint_path.display());

            if self.config.print_every_n_batches > 0
                && epoch % self.config.print_every_n_batches == 0
            {
                info!("Epoch {} - loss: {:.4}", epoch, avg_loss);
            }
        }

        let metrics_path = run_folder.join("training_metrics.csv");
        self.metrics.save_csv(&metrics_path.to_string_lossy())?;

        Ok(&self.metrics)
    }

    /// Get training metrics
    pub fn metrics(&self) -> &AutoencoderMetrics {
        &self.metrics
    }

    /// Get configuration
    pub fn config(&self) -> &AutoencoderTrainingConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AutoencoderConfig, ImageShape};
    use tch::Kind;

    fn tiny_model() -> Autoencoder {
        let config = AutoencoderConfig {
            input_dim: ImageShape::new(1, 4, 4),
            encoder_conv_filters: vec![4],
            encoder_conv_kernel_size: vec![3],
            encoder_conv_strides: vec![2],
            decoder_conv_t_filters: vec![1],
            decoder_conv_t_kernel_size: vec![3],
            decoder_conv_t_strides: vec![2],
            z_dim: 2,
            use_batch_norm: false,
            use_dropout: false,
        };
        Autoencoder::new(config, Device::Cpu).unwrap()
    }

    #[test]
    fn test_training_config_default() {
        let config = AutoencoderTrainingConfig::default();
        assert_eq!(config.print_every_n_batches, 100);
        assert_eq!(config.initial_epoch, 0);
        assert_eq!(config.lr_decay, 1.0);
    }

    #[test]
    fn test_train_runs_requested_epochs_with_decay() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = tiny_model();
        model.compile(0.01).unwrap();

        let x_train = Tensor::rand([10, 1, 4, 4], (Kind::Float, Device::Cpu));
        let config = AutoencoderTrainingConfig {
            batch_size: 4,
            epochs: 4,
            initial_epoch: 1,
            lr_decay: 0.5,
            print_every_n_batches: 1,
            run_folder: dir.path().to_path_buf(),
            ..Default::default()
        };

        let mut trainer = AutoencoderTrainer::new(config, Device::Cpu);
        let metrics = trainer.train(&mut model, &x_train).unwrap();

        assert_eq!(metrics.epochs, vec![1, 2, 3]);
        assert_eq!(metrics.learning_rates, vec![0.005, 0.0025, 0.00125]);
        assert!(metrics.losses.iter().all(|l| l.is_finite() && *l >= 0.0));

        assert!(dir.path().join("weights/weights.ot").exists());
        assert!(dir.path().join("training_metrics.csv").exists());
    }

    #[test]
    fn test_train_rejects_wrong_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = tiny_model();
        model.compile(0.01).unwrap();

        let x_train = Tensor::rand([10, 3, 4, 4], (Kind::Float, Device::Cpu));
        let config = AutoencoderTrainingConfig {
            run_folder: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut trainer = AutoencoderTrainer::new(config, Device::Cpu);
        assert!(trainer.train(&mut model, &x_train).is_err());
    }

    #[test]
    fn test_train_rejects_empty_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = tiny_model();
        model.compile(0.01).unwrap();

        let x_train = Tensor::zeros([0, 1, 4, 4], (Kind::Float, Device::Cpu));
        let config = AutoencoderTrainingConfig {
            epochs: 2,
            run_folder: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut trainer = AutoencoderTrainer::new(config, Device::Cpu);
        let err = trainer.train(&mut model, &x_train).unwrap_err();
        assert!(err.to_string().contains("empty"));
        assert!(trainer.metrics().losses.is_empty());
    }

    #[test]
    fn test_loss_decreases_on_constant_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = tiny_model();
        model.compile(0.01).unwrap();

        let x_train = Tensor::full([16, 1, 4, 4], 0.8, (Kind::Float, Device::Cpu));
        let config = AutoencoderTrainingConfig {
            batch_size: 8,
            epochs: 30,
            print_every_n_batches: 10,
            run_folder: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut trainer = AutoencoderTrainer::new(config, Device::Cpu);
        let metrics = trainer.train(&mut model, &x_train).unwrap();

        let first = metrics.losses[0];
        let last = metrics.latest_loss().unwrap();
        assert!(last < first);
    }
}
