//! Configuration management
//!
//! Provides unified configuration for both models and their training runs.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::data::DataConfig;
use crate::model::{AutoencoderConfig, WganGpConfig};
use crate::training::{AutoencoderTrainingConfig, WganTrainingConfig};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device: "cpu" or "cuda"
    pub device: String,
    /// Autoencoder dataset
    pub data: DataConfig,
    /// Autoencoder architecture
    pub autoencoder: AutoencoderConfig,
    /// Autoencoder training run
    pub ae_training: AutoencoderTrainingConfig,
    /// WGAN-GP architecture and optimisers
    pub wgan: WganGpConfig,
    /// WGAN-GP training run
    pub wgan_training: WganTrainingConfig,
    /// WGAN-GP dataset
    #[serde(default = "DataConfig::faces")]
    pub wgan_data: DataConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            data: DataConfig::default(),
            autoencoder: AutoencoderConfig::default(),
            ae_training: AutoencoderTrainingConfig::default(),
            wgan: WganGpConfig::default(),
            wgan_training: WganTrainingConfig::default(),
            wgan_data: DataConfig::faces(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from TOML file
    pub fn from_toml<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from `.toml` or JSON depending on the extension
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if is_toml(path) {
            Self::from_toml(path)
        } else {
            Self::from_json(path)
        }
    }

    /// Save as `.toml` or JSON depending on the extension
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if is_toml(path) {
            self.save_toml(path)
        } else {
            self.save_json(path)
        }
    }

    /// Get device from configuration
    pub fn get_device(&self) -> tch::Device {
        match self.device.to_lowercase().as_str() {
            "cuda" | "gpu" => {
                if tch::Cuda::is_available() {
                    tch::Device::Cuda(0)
                } else {
                    tracing::warn!("CUDA requested but not available, falling back to CPU");
                    tch::Device::Cpu
                }
            }
            _ => tch::Device::Cpu,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.autoencoder.validate()?;
        self.wgan.validate()?;

        for data in [&self.data, &self.wgan_data] {
            if data.image_height <= 0 || data.image_width <= 0 {
                anyhow::bail!("Image height and width must be > 0");
            }
        }
        if self.data.image_shape() != self.autoencoder.input_dim {
            anyhow::bail!(
                "Autoencoder input {} does not match its dataset images {}",
                self.autoencoder.input_dim,
                self.data.image_shape()
            );
        }
        if self.wgan_data.image_shape() != self.wgan.input_dim {
            anyhow::bail!(
                "WGAN-GP input {} does not match its dataset images {}",
                self.wgan.input_dim,
                self.wgan_data.image_shape()
            );
        }
        if self.ae_training.batch_size == 0 {
            anyhow::bail!("Batch size must be > 0");
        }
        if self.ae_training.learning_rate <= 0.0 || self.wgan.critic_learning_rate <= 0.0 {
            anyhow::bail!("Learning rates must be > 0");
        }
        if self.ae_training.lr_decay <= 0.0 {
            anyhow::bail!("Learning rate decay must be > 0");
        }
        if self.wgan_training.n_critic == 0 {
            anyhow::bail!("Critic steps per generator step must be > 0");
        }
        Ok(())
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().map(|e| e == "toml").unwrap_or(false)
}

/// Create default configuration file if it doesn't exist
pub fn ensure_config_exists<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    if path.exists() {
        Config::load(path)
    } else {
        let config = Config::default();
        config.save(path)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.autoencoder.z_dim, 2);
        assert_eq!(config.wgan.z_dim, 100);
        assert_eq!(config.wgan.grad_weight, 10.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(config, loaded);
    }

    #[test]
    fn test_config_toml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::default();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(config, loaded);
    }

    #[test]
    fn test_config_from_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&Config::default()).unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let loaded = Config::from_json(file.path()).unwrap();
        assert_eq!(loaded.device, "cpu");
    }

    #[test]
    fn test_ensure_config_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let created = ensure_config_exists(&path).unwrap();
        assert!(path.exists());

        let loaded = ensure_config_exists(&path).unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.autoencoder.encoder_conv_strides.pop();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.wgan_training.n_critic = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_datasets_fit_both_models() {
        let config = Config::default();
        assert_eq!(config.data.image_shape(), config.autoencoder.input_dim);
        assert_eq!(config.wgan_data.image_shape(), config.wgan.input_dim);
    }

    #[test]
    fn test_dataset_shape_mismatch_rejected() {
        let mut config = Config::default();
        config.wgan_data = DataConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("WGAN-GP input"));

        let mut config = Config::default();
        config.data.source = crate::data::DataSource::Images;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_wgan_data_falls_back_to_faces() {
        let mut value = serde_json::to_value(Config::default()).unwrap();
        value.as_object_mut().unwrap().remove("wgan_data");

        let config: Config = serde_json::from_value(value).unwrap();
        assert_eq!(config.wgan_data, DataConfig::faces());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cpu_device() {
        let config = Config::default();
        assert_eq!(config.get_device(), tch::Device::Cpu);
    }
}
