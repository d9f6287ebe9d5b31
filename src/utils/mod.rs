//! Utility module with helper functions
//!
//! This module provides:
//! - Configuration handling
//! - Run folder and checkpoint save/load utilities

pub mod checkpoint;
mod config;

pub use checkpoint::{
    create_run_folder, find_latest_checkpoint, load_params, load_training_state, save_params,
    save_training_state, TrainingState,
};
pub use config::{ensure_config_exists, Config};
