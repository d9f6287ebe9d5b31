//! Run folder and checkpoint save/load utilities
//!
//! A run folder holds `params.json` (constructor arguments), the `viz/`,
//! `weights/` and `images/` subfolders, and for the WGAN-GP a
//! `state.json` with the epoch counter and loss history.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::training::{CriticLoss, WganMetrics};

const PARAMS_FILE: &str = "params.json";
const STATE_FILE: &str = "state.json";

/// Create `folder` with its `viz`, `weights` and `images` subfolders
pub fn create_run_folder<P: AsRef<Path>>(folder: P) -> anyhow::Result<()> {
    let folder = folder.as_ref();
    for sub in ["viz", "weights", "images"] {
        std::fs::create_dir_all(folder.join(sub))?;
    }
    Ok(())
}

/// Write constructor arguments to `params.json`
pub fn save_params<P: AsRef<Path>, T: Serialize>(folder: P, params: &T) -> anyhow::Result<()> {
    let path = folder.as_ref().join(PARAMS_FILE);
    let json = serde_json::to_string_pretty(params)?;
    std::fs::write(&path, json)?;
    tracing::debug!("Saved params to {}", path.display());
    Ok(())
}

/// Read constructor arguments back from `params.json`
pub fn load_params<P: AsRef<Path>, T: DeserializeOwned>(folder: P) -> anyhow::Result<T> {
    let path = folder.as_ref().join(PARAMS_FILE);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", path.display(), e))?;
    Ok(serde_json::from_str(&content)?)
}

/// Resumable WGAN-GP training state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Epoch counter at save time
    pub epoch: usize,
    pub d_losses: Vec<CriticLoss>,
    pub g_losses: Vec<f64>,
    /// Timestamp of checkpoint
    pub timestamp: String,
}

impl TrainingState {
    pub fn new(epoch: usize, metrics: &WganMetrics) -> Self {
        Self {
            epoch,
            d_losses: metrics.d_losses.clone(),
            g_losses: metrics.g_losses.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Write `state.json` into the run folder
pub fn save_training_state<P: AsRef<Path>>(
    run_folder: P,
    state: &TrainingState,
) -> anyhow::Result<()> {
    let path = run_folder.as_ref().join(STATE_FILE);
    let json = serde_json::to_string_pretty(state)?;
    std::fs::write(&path, json)?;

    tracing::info!("Saved training state to {} (epoch {})", path.display(), state.epoch);
    Ok(())
}

/// Read `state.json` if the run folder has one
pub fn load_training_state<P: AsRef<Path>>(run_folder: P) -> anyhow::Result<Option<TrainingState>> {
    let path = run_folder.as_ref().join(STATE_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path)?;
    let state: TrainingState = serde_json::from_str(&content)?;
    Ok(Some(state))
}

/// Find the latest `epoch_XXXX` weights folder in a directory
pub fn find_latest_checkpoint<P: AsRef<Path>>(dir: P) -> Option<PathBuf> {
    let path = dir.as_ref();
    if !path.exists() {
        return None;
    }

    let mut checkpoints: Vec<_> = std::fs::read_dir(path)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().ok().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|n| n.starts_with("epoch_"))
                .unwrap_or(false)
        })
        .collect();

    checkpoints.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    checkpoints.first().map(|e| e.path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AutoencoderConfig;

    #[test]
    fn test_create_run_folder() {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path().join("run/vae/0001_digits");
        create_run_folder(&run).unwrap();

        assert!(run.join("viz").is_dir());
        assert!(run.join("weights").is_dir());
        assert!(run.join("images").is_dir());

        // Existing folders are fine
        create_run_folder(&run).unwrap();
    }

    #[test]
    fn test_params_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = AutoencoderConfig::default();

        save_params(dir.path(), &config).unwrap();
        let loaded: AutoencoderConfig = load_params(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_params_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result: anyhow::Result<AutoencoderConfig> = load_params(dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_training_state() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_training_state(dir.path()).unwrap().is_none());

        let mut metrics = WganMetrics::new();
        metrics.record(
            CriticLoss {
                total: -2.0,
                real: -4.0,
                fake: 1.5,
                gradient_penalty: 0.05,
            },
            3.0,
        );
        let state = TrainingState::new(42, &metrics);
        save_training_state(dir.path(), &state).unwrap();

        let loaded = load_training_state(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.epoch, 42);
    }

    #[test]
    fn test_find_latest_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_latest_checkpoint(dir.path()).is_none());

        for name in ["epoch_0000", "epoch_0120", "epoch_0040", "latest"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }

        let latest = find_latest_checkpoint(dir.path()).unwrap();
        assert!(latest.ends_with("epoch_0120"));
    }
}
