//! Configuration for training sessions.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Environment variables are prefixed with `TRAINLOOP_` and use `__` to reach nested tables,
//! e.g. `TRAINLOOP_CHECKPOINT__EVERY_EPOCHS=5`.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::EngineResult;
use crate::model::Device;

/// Settings for one training session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of samples per optimizer step.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Samples per forward/backward pass; defaults to `batch_size`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mini_batch_size: Option<usize>,
    /// Stop after this many epochs. Unbounded when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_epochs: Option<u64>,
    #[serde(default)]
    pub device: Device,
    /// Install a Ctrl-C listener that requests a graceful stop.
    #[serde(default = "default_true")]
    pub handle_interrupt: bool,
    /// Periodic checkpointing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointConfig>,
    /// Extra hyperparameters. A leading `_` keeps a field out of saved records.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            mini_batch_size: None,
            max_epochs: None,
            device: Device::default(),
            handle_interrupt: true,
            checkpoint: None,
            fields: BTreeMap::new(),
        }
    }
}

/// Where and how often to write checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    #[serde(default = "default_every_epochs")]
    pub every_epochs: u64,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_batch_size() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_every_epochs() -> u64 {
    1
}

fn default_prefix() -> String {
    "checkpoint".into()
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `TRAINLOOP_`)
/// 3. The TOML file at `path`, when given and present
/// 4. Built-in defaults
pub fn load_config(
    path: Option<&Path>,
    overrides: Option<&TrainingConfig>,
) -> EngineResult<TrainingConfig> {
    let mut figment = Figment::from(Serialized::defaults(TrainingConfig::default()));

    if let Some(path) = path {
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        }
    }

    figment = figment.merge(Env::prefixed("TRAINLOOP_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| Box::new(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TrainingConfig::default();
        assert_eq!(config.batch_size, 1);
        assert!(config.mini_batch_size.is_none());
        assert!(config.handle_interrupt);
        assert_eq!(config.device, Device::Cpu);
        assert!(config.fields.is_empty());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.toml");
        std::fs::write(
            &path,
            r#"
batch_size = 64
mini_batch_size = 16
max_epochs = 30
device = "cuda:1"

[checkpoint]
dir = "runs/exp1"
every_epochs = 5

[fields]
learning_rate = 0.01
_run_name = "exp1"
"#,
        )
        .unwrap();

        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.mini_batch_size, Some(16));
        assert_eq!(config.max_epochs, Some(30));
        assert_eq!(config.device, Device::Cuda(1));
        let checkpoint = config.checkpoint.unwrap();
        assert_eq!(checkpoint.dir, PathBuf::from("runs/exp1"));
        assert_eq!(checkpoint.every_epochs, 5);
        assert_eq!(checkpoint.prefix, "checkpoint");
        assert_eq!(config.fields["learning_rate"], json!(0.01));
        assert_eq!(config.fields["_run_name"], json!("exp1"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/train.toml")), None).unwrap();
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_overrides_win() {
        let overrides = TrainingConfig {
            batch_size: 32,
            max_epochs: Some(2),
            ..TrainingConfig::default()
        };
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.max_epochs, Some(2));
    }

    #[test]
    fn test_invalid_device_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "device = \"tpu\"\n").unwrap();
        assert!(load_config(Some(&path), None).is_err());
    }
}
