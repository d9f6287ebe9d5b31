//! Training metrics for monitoring progress
//!
//! Provides loss histories for both models and their CSV export.

use serde::{Deserialize, Serialize};

/// Autoencoder loss and learning rate per epoch
#[derive(Debug, Clone, Default)]
pub struct AutoencoderMetrics {
    /// Absolute epoch index of each record
    pub epochs: Vec<usize>,
    /// Mean reconstruction loss per epoch
    pub losses: Vec<f64>,
    /// Learning rate used in each epoch
    pub learning_rates: Vec<f64>,
}

impl AutoencoderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_epoch(&mut self, epoch: usize, loss: f64, learning_rate: f64) {
        self.epochs.push(epoch);
        self.losses.push(loss);
        self.learning_rates.push(learning_rate);
    }

    pub fn num_epochs(&self) -> usize {
        self.losses.len()
    }

    pub fn latest_loss(&self) -> Option<f64> {
        self.losses.last().copied()
    }

    /// Lowest epoch loss seen so far
    pub fn best_loss(&self) -> Option<f64> {
        self.losses.iter().copied().reduce(f64::min)
    }

    /// Save metrics to CSV file
    pub fn save_csv(&self, path: &str) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;

        writer.write_record(["epoch", "loss", "lr"])?;

        for i in 0..self.num_epochs() {
            writer.write_record([
                self.epochs[i].to_string(),
                self.losses[i].to_string(),
                self.learning_rates[i].to_string(),
            ])?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Load metrics from CSV file
    pub fn load_csv(path: &str) -> anyhow::Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut metrics = Self::new();

        for result in reader.records() {
            let record = result?;
            metrics.epochs.push(record[0].parse()?);
            metrics.losses.push(record[1].parse()?);
            metrics.learning_rates.push(record[2].parse()?);
        }

        Ok(metrics)
    }
}

/// Critic loss of one training step
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CriticLoss {
    /// real + fake + grad_weight * gradient_penalty
    pub total: f64,
    /// Wasserstein term on real images (target +1)
    pub real: f64,
    /// Wasserstein term on generated images (target -1)
    pub fake: f64,
    /// Unweighted gradient penalty
    pub gradient_penalty: f64,
}

/// WGAN-GP loss history, one entry per epoch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WganMetrics {
    /// Last critic loss of each epoch
    pub d_losses: Vec<CriticLoss>,
    /// Generator loss of each epoch
    pub g_losses: Vec<f64>,
}

impl WganMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, d_loss: CriticLoss, g_loss: f64) {
        self.d_losses.push(d_loss);
        self.g_losses.push(g_loss);
    }

    pub fn num_epochs(&self) -> usize {
        self.g_losses.len()
    }

    pub fn latest_d_loss(&self) -> Option<CriticLoss> {
        self.d_losses.last().copied()
    }

    pub fn latest_g_loss(&self) -> Option<f64> {
        self.g_losses.last().copied()
    }

    /// Save metrics to CSV file
    pub fn save_csv(&self, path: &str) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;

        writer.write_record(["epoch", "d_loss", "d_real", "d_fake", "d_gp", "g_loss"])?;

        for (i, (d, g)) in self.d_losses.iter().zip(&self.g_losses).enumerate() {
            writer.write_record([
                i.to_string(),
                d.total.to_string(),
                d.real.to_string(),
                d.fake.to_string(),
                d.gradient_penalty.to_string(),
                g.to_string(),
            ])?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Load metrics from CSV file
    pub fn load_csv(path: &str) -> anyhow::Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut metrics = Self::new();

        for result in reader.records() {
            let record = result?;
            metrics.record(
                CriticLoss {
                    total: record[1].parse()?,
                    real: record[2].parse()?,
                    fake: record[3].parse()?,
                    gradient_penalty: record[4].parse()?,
                },
                record[5].parse()?,
            );
        }

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autoencoder_metrics() {
        let mut metrics = AutoencoderMetrics::new();

        metrics.record_epoch(0, 0.08, 0.0005);
        metrics.record_epoch(1, 0.05, 0.0005);
        metrics.record_epoch(2, 0.06, 0.0005);

        assert_eq!(metrics.num_epochs(), 3);
        assert_eq!(metrics.latest_loss(), Some(0.06));
        assert_eq!(metrics.best_loss(), Some(0.05));
    }

    #[test]
    fn test_autoencoder_metrics_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let path = path.to_str().unwrap();

        let mut metrics = AutoencoderMetrics::new();
        metrics.record_epoch(3, 0.25, 0.001);
        metrics.save_csv(path).unwrap();

        let loaded = AutoencoderMetrics::load_csv(path).unwrap();
        assert_eq!(loaded.epochs, vec![3]);
        assert_eq!(loaded.losses, vec![0.25]);
    }

    #[test]
    fn test_wgan_metrics_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let path = path.to_str().unwrap();

        let mut metrics = WganMetrics::new();
        let d = CriticLoss {
            total: -1.5,
            real: -3.0,
            fake: 1.0,
            gradient_penalty: 0.05,
        };
        metrics.record(d, 2.5);
        metrics.save_csv(path).unwrap();

        let loaded = WganMetrics::load_csv(path).unwrap();
        assert_eq!(loaded, metrics);
        assert_eq!(loaded.latest_d_loss(), Some(d));
        assert_eq!(loaded.latest_g_loss(), Some(2.5));
    }
}
