//! # Trainloop Core
//!
//! Orchestration layer for model training loops.
//! Provides the epoch/batch state machine with mini-batch accumulation,
//! interval-keyed hooks, a hyperparameter store with save/load, graceful
//! interrupt handling and layered configuration. Numeric work stays behind
//! the [`Model`], [`Optimizer`], [`Scheduler`] and [`Engine`] traits.

pub mod bridge;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod interrupt;
pub mod model;
pub mod params;
pub mod persistence;

#[cfg(test)]
mod testing;

// Re-export commonly used types at the crate root.
pub use bridge::AttributeBridge;
pub use checkpoint::{checkpoint_hook, checkpoint_path, latest_checkpoint, register_checkpoints};
pub use config::{CheckpointConfig, TrainingConfig, load_config};
pub use data::DataLoader;
pub use engine::{Engine, StopReason, Trainer};
pub use error::{EngineError, EngineResult};
pub use hooks::{Hook, HookPoint, HookRegistry, HookTable};
pub use interrupt::Interrupt;
pub use model::{
    Device, DeviceTensor, Model, Optimizer, Scheduler, StateDict, StateSlot, Stateful,
    check_state_keys,
};
pub use params::{EXCLUDE_PREFIX, HyperParameters, HyperParametersBuilder};
pub use persistence::{Record, read_record, write_record};
