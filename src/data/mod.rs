//! Data module for loading and batching image datasets
//!
//! This module provides:
//! - MNIST and image-folder loaders
//! - DataLoader and random sampling for batching images
//! - Image grid export for samples and reconstructions

mod images;
mod loader;

pub use images::{
    load_dataset, load_image_folder, load_mnist, save_image_grid, to_tanh_range, DataConfig,
    DataSource,
};
pub use loader::{BatchSource, DataLoader, DataLoaderIter, RandomSampler};
