//! Model module containing the network architectures
//!
//! This module provides:
//! - Shared "same"-padded convolution layers and model summaries
//! - Convolutional autoencoder (encoder, decoder and the composed model)
//! - Critic and Generator networks
//! - WGAN-GP wrapper combining both with their optimizers

pub mod layers;
mod autoencoder;
mod critic;
mod generator;
mod wgan_gp;

pub use autoencoder::{Autoencoder, AutoencoderConfig, Decoder, Encoder};
pub use critic::{Critic, CriticConfig};
pub use generator::{Generator, GeneratorConfig};
pub use layers::{Activation, ImageShape, ModelSummary};
pub use wgan_gp::{OptimiserKind, WganGp, WganGpConfig};
