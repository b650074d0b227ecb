//! Periodic checkpoints of the hyperparameter store.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CheckpointConfig;
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::hooks::{Hook, HookPoint, HookRegistry};

/// `<dir>/<prefix>_<epoch>.json`
pub fn checkpoint_path(dir: &Path, prefix: &str, epoch: u64) -> PathBuf {
    dir.join(format!("{prefix}_{epoch}.json"))
}

/// Epoch-end hook saving the engine's hyperparameters to [`checkpoint_path`].
pub fn checkpoint_hook<E: Engine + 'static>(
    dir: impl Into<PathBuf>,
    prefix: impl Into<String>,
) -> Hook<E> {
    let dir = dir.into();
    let prefix = prefix.into();
    Hook::free(move |engine: &mut E| {
        let params = engine.params();
        let path = checkpoint_path(&dir, &prefix, params.epoch);
        params.save(&path)?;
        info!(path = %path.display(), epoch = params.epoch, "Saved checkpoint");
        Ok(())
    })
}

/// Attach a [`checkpoint_hook`] firing every `config.every_epochs` epochs.
///
/// # Panics
///
/// Panics if `every_epochs` is 0.
pub fn register_checkpoints<E: Engine + 'static>(
    hooks: &mut HookRegistry<E>,
    config: &CheckpointConfig,
) {
    hooks.register(
        HookPoint::EpochEnd,
        config.every_epochs,
        checkpoint_hook(config.dir.clone(), config.prefix.clone()),
    );
}

/// Highest-epoch checkpoint in `dir` written with `prefix`, if any.
pub fn latest_checkpoint(dir: &Path, prefix: &str) -> EngineResult<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut latest: Option<(u64, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(epoch) = checkpoint_epoch(&path, prefix) else {
            continue;
        };
        if latest.as_ref().is_none_or(|(best, _)| epoch > *best) {
            latest = Some((epoch, path));
        }
    }
    Ok(latest.map(|(_, path)| path))
}

fn checkpoint_epoch(path: &Path, prefix: &str) -> Option<u64> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataLoader;
    use crate::engine::Trainer;
    use crate::params::HyperParameters;
    use crate::persistence::read_record;
    use crate::testing::Scalar;
    use serde_json::json;

    struct Drift {
        params: HyperParameters<Scalar>,
        max_epochs: u64,
    }

    impl Engine for Drift {
        type Model = Scalar;
        type Loader = Vec<f64>;

        fn params(&self) -> &HyperParameters<Scalar> {
            &self.params
        }

        fn params_mut(&mut self) -> &mut HyperParameters<Scalar> {
            &mut self.params
        }

        fn process_batch(&mut self, data: <Vec<f64> as DataLoader>::Batch) -> EngineResult<()> {
            self.params.model_mut().weight += data;
            Ok(())
        }

        fn train_batch(&mut self) -> EngineResult<()> {
            Ok(())
        }

        fn quit(&mut self) -> bool {
            self.params.epoch >= self.max_epochs
        }
    }

    fn drift(max_epochs: u64) -> Drift {
        let params = HyperParameters::builder(Scalar::default())
            .field("note", "drift")
            .build()
            .unwrap();
        Drift { params, max_epochs }
    }

    #[test]
    fn test_checkpoint_path() {
        assert_eq!(
            checkpoint_path(Path::new("/tmp/run"), "ckpt", 12),
            PathBuf::from("/tmp/run/ckpt_12.json")
        );
    }

    #[test]
    fn test_checkpoints_follow_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(drift(5), Some(vec![0.5, 0.5]));
        register_checkpoints(
            trainer.hooks_mut(),
            &CheckpointConfig {
                dir: dir.path().to_path_buf(),
                every_epochs: 2,
                prefix: "ckpt".into(),
            },
        );
        trainer.run().unwrap();

        assert!(!dir.path().join("ckpt_1.json").exists());
        assert!(dir.path().join("ckpt_2.json").exists());
        assert!(dir.path().join("ckpt_4.json").exists());
        assert!(!dir.path().join("ckpt_5.json").exists());

        let record = read_record(&dir.path().join("ckpt_4.json")).unwrap();
        assert_eq!(record["epoch"], json!(4));
        assert_eq!(record["batch"], json!(8));
        assert_eq!(record["note"], json!("drift"));
        assert_eq!(record["model"]["weight"], json!(4.0));
    }

    #[test]
    fn test_latest_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(latest_checkpoint(dir.path(), "ckpt").unwrap(), None);

        for name in [
            "ckpt_2.json",
            "ckpt_10.json",
            "ckpt_9.json",
            "other_30.json",
            "ckpt_x.json",
        ] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }
        std::fs::write(dir.path().join("ckpt_40.tmp"), "{}").unwrap();

        assert_eq!(
            latest_checkpoint(dir.path(), "ckpt").unwrap(),
            Some(dir.path().join("ckpt_10.json"))
        );
    }

    #[test]
    fn test_latest_checkpoint_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(latest_checkpoint(&missing, "ckpt").unwrap(), None);
    }
}
