//! # Convolutional Autoencoder and WGAN-GP
//!
//! This crate provides two image models built on libtorch:
//! a convolutional autoencoder with a small latent space, and a
//! Wasserstein GAN trained with a gradient penalty.
//!
//! ## Modules
//!
//! - `data`: MNIST / image-folder loading, batching and image grids
//! - `model`: Autoencoder, Critic, Generator and the WGAN-GP wrapper
//! - `training`: Training loops, loss functions and metrics
//! - `utils`: Configuration and run folder persistence

pub mod data;
pub mod model;
pub mod training;
pub mod utils;

pub use data::{BatchSource, DataConfig, DataLoader, DataSource, RandomSampler};
pub use model::{Autoencoder, AutoencoderConfig, Critic, Generator, WganGp, WganGpConfig};
pub use training::{
    AutoencoderMetrics, AutoencoderTrainer, AutoencoderTrainingConfig, WganMetrics, WganTrainer,
    WganTrainingConfig,
};
pub use utils::{Config, TrainingState};
