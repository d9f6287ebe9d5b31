//! Training module for both models
//!
//! This module provides:
//! - Autoencoder training loop with step-decay learning rate
//! - WGAN-GP training loop alternating critic and generator updates
//! - Loss functions (reconstruction, Wasserstein, gradient penalty)
//! - Loss histories and their CSV export

mod autoencoder_trainer;
pub mod losses;
mod metrics;
mod schedule;
mod wgan_trainer;

pub use autoencoder_trainer::{AutoencoderTrainer, AutoencoderTrainingConfig};
pub use losses::{gradient_penalty_loss, random_weighted_average, reconstruction_loss, wasserstein};
pub use metrics::{AutoencoderMetrics, CriticLoss, WganMetrics};
pub use schedule::{step_decay_schedule, StepDecay};
pub use wgan_trainer::{critic_loops, WganTrainer, WganTrainingConfig};
