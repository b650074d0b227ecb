//! Subcommand handlers.

use anyhow::Context;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

use trainloop_core::{
    Engine, Model, Record, StopReason, Trainer, TrainingConfig, read_record, register_checkpoints,
};

use crate::Commands;
use crate::demo::{MeanEngine, synthetic_samples};

/// Record keys holding object state rather than plain fields.
const RESERVED_KEYS: [&str; 3] = ["model", "optimizers", "schedulers"];

pub fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            config,
            epochs,
            resume,
            save,
        } => handle_run(config.as_deref(), epochs, resume.as_deref(), save),
        Commands::Inspect { file } => {
            let record = read_record(&file)
                .with_context(|| format!("Failed to read record {}", file.display()))?;
            print!("{}", describe_record(&record));
            Ok(())
        }
        Commands::Config { config } => {
            let config = load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load(path: Option<&Path>) -> anyhow::Result<TrainingConfig> {
    trainloop_core::load_config(path, None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn handle_run(
    config_path: Option<&Path>,
    epochs: Option<u64>,
    resume: Option<&Path>,
    save: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = load(config_path)?;
    if epochs.is_some() {
        config.max_epochs = epochs;
    }
    if config.max_epochs.is_none() {
        info!("No epoch limit configured, press Ctrl-C to stop");
    }

    let mut engine = MeanEngine::from_config(&config)?;
    if let Some(path) = resume {
        engine
            .params_mut()
            .load(path, true)
            .with_context(|| format!("Failed to resume from {}", path.display()))?;
        info!(path = %path.display(), "Resumed training state");
    }

    let mut trainer = Trainer::new(engine, Some(synthetic_samples(&config)));
    trainer.params_mut().to(config.device)?;
    info!(device = %trainer.params().model().device(), "Training state placed");
    if config.handle_interrupt {
        trainer.install_interrupt_handler()?;
    }
    if let Some(checkpoint) = &config.checkpoint {
        register_checkpoints(trainer.hooks_mut(), checkpoint);
    }

    let reason = trainer.run()?;
    trainer.params_mut().model_mut().eval();
    trainer.log(format!(
        "Estimated mean {:.4} after {} epochs",
        trainer.engine().mean(),
        trainer.params().epoch
    ));

    if let Some(path) = save {
        trainer
            .params()
            .save(&path)
            .with_context(|| format!("Failed to save to {}", path.display()))?;
        println!("Saved training state to {}", path.display());
    }

    match reason {
        StopReason::Quit => println!("Training finished"),
        StopReason::Interrupted => println!("Training interrupted"),
    }
    Ok(())
}

/// Plain fields of a record, one `name = value` line each, followed by a
/// summary of the object state it carries.
fn describe_record(record: &Record) -> String {
    let mut out = String::new();
    for (name, value) in record {
        if RESERVED_KEYS.contains(&name.as_str()) {
            continue;
        }
        out.push_str(&format!("{name} = {value}\n"));
    }
    for key in RESERVED_KEYS {
        match record.get(key) {
            Some(Value::Array(states)) => {
                out.push_str(&format!("{key}: {} snapshot(s)\n", states.len()));
            }
            Some(Value::Object(state)) => {
                out.push_str(&format!("{key}: {} entries\n", state.len()));
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_describe_record() {
        let record = json!({
            "batch": 12,
            "epoch": 3,
            "lr": 0.05,
            "model": { "mean": 2.9 },
            "optimizers": [{ "steps": 12 }],
        });
        let Value::Object(record) = record else {
            unreachable!()
        };

        assert_eq!(
            describe_record(&record),
            "batch = 12\nepoch = 3\nlr = 0.05\nmodel: 1 entries\noptimizers: 1 snapshot(s)\n"
        );
    }

    #[test]
    fn test_run_save_then_resume() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("train.toml");
        let first = dir.path().join("first.json");
        let second = dir.path().join("second.json");
        std::fs::write(
            &config_path,
            "batch_size = 4\nmini_batch_size = 2\nhandle_interrupt = false\n\n[fields]\nsamples = 8\n",
        )
        .unwrap();

        handle_run(Some(&config_path), Some(2), None, Some(first.clone())).unwrap();
        let record = read_record(&first).unwrap();
        assert_eq!(record["epoch"], json!(2));
        assert_eq!(record["batch"], json!(8));
        assert_eq!(record["samples"], json!(8));

        handle_run(Some(&config_path), Some(3), Some(&first), Some(second.clone())).unwrap();
        let record = read_record(&second).unwrap();
        assert_eq!(record["epoch"], json!(3));
        assert_eq!(record["batch"], json!(12));
        assert_eq!(record["schedulers"][0]["last_epoch"], json!(3));
    }

    #[test]
    fn test_run_rejects_bad_geometry() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("train.toml");
        std::fs::write(&config_path, "batch_size = 6\nmini_batch_size = 4\n").unwrap();
        let err = handle_run(Some(&config_path), Some(1), None, None).unwrap_err();
        assert!(err.to_string().contains("multiple of mini_batch_size"));
    }
}
