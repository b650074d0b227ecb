//! Collaborator contracts consumed by the training loop.
//!
//! The engine never performs numeric work itself. Models, optimizers and
//! schedulers are opaque objects that can snapshot and restore their state,
//! and expose just enough structure for device migration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Serialized state of a model, keyed by parameter name.
pub type StateDict = Map<String, Value>;

/// Compute device a model and its training state live on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

impl FromStr for Device {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| {
                    EngineError::invalid_value("device", format!("unrecognized device '{s}'"))
                }),
        }
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

impl TryFrom<String> for Device {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// The trainable entity driven by an engine.
pub trait Model {
    /// Switch between training and evaluation mode.
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Snapshot the model state.
    fn state_dict(&self) -> StateDict;

    /// Restore a snapshot. With `strict` set, missing or unexpected keys are an error.
    fn load_state_dict(&mut self, state: StateDict, strict: bool) -> EngineResult<()>;

    /// Move every parameter of the model to `device`.
    fn to_device(&mut self, device: Device) -> EngineResult<()>;

    fn train(&mut self) {
        self.set_training(true);
    }

    fn eval(&mut self) {
        self.set_training(false);
    }
}

/// A tensor-like value that can be moved between devices.
pub trait DeviceTensor {
    fn to_device(&mut self, device: Device);

    /// Gradient buffer attached to this value, if any.
    fn grad_mut(&mut self) -> Option<&mut dyn DeviceTensor> {
        None
    }
}

/// One entry of an optimizer's or scheduler's internal state.
pub enum StateSlot<'a> {
    Tensor(&'a mut dyn DeviceTensor),
    /// A mapping of further entries, e.g. per-parameter momentum buffers.
    Map(Vec<StateSlot<'a>>),
    /// Anything that is not device-bound (step counts, learning rates).
    Opaque,
}

/// Objects whose state can be snapshotted and restored.
pub trait Stateful {
    fn state_dict(&self) -> Value;

    fn load_state_dict(&mut self, state: Value) -> EngineResult<()>;

    /// Internal state entries, walked during device migration.
    fn state_slots(&mut self) -> Vec<StateSlot<'_>> {
        Vec::new()
    }
}

/// Applies accumulated updates to the model parameters.
pub trait Optimizer: Stateful {
    fn step(&mut self) -> EngineResult<()>;

    fn zero_grad(&mut self) {}
}

/// Adjusts optimizer hyperparameters over the course of training.
pub trait Scheduler: Stateful {
    fn step(&mut self) -> EngineResult<()>;
}

/// Move the tensors found in `slots` to `device`, descending at most `depth` levels.
///
/// Returns the number of tensors moved. Gradient buffers travel with their value.
pub(crate) fn migrate_slots(slots: Vec<StateSlot<'_>>, device: Device, depth: usize) -> usize {
    let mut moved = 0;
    for slot in slots {
        match slot {
            StateSlot::Tensor(tensor) => {
                tensor.to_device(device);
                if let Some(grad) = tensor.grad_mut() {
                    grad.to_device(device);
                }
                moved += 1;
            }
            StateSlot::Map(inner) if depth > 1 => {
                moved += migrate_slots(inner, device, depth - 1);
            }
            StateSlot::Map(_) | StateSlot::Opaque => {}
        }
    }
    moved
}

/// Compare the keys of a model's current state with a snapshot about to be restored.
///
/// Lenient mode only logs the difference; strict mode turns it into
/// [`EngineError::StateMismatch`].
pub fn check_state_keys(expected: &StateDict, given: &StateDict, strict: bool) -> EngineResult<()> {
    let missing: Vec<String> = expected
        .keys()
        .filter(|key| !given.contains_key(*key))
        .cloned()
        .collect();
    let unexpected: Vec<String> = given
        .keys()
        .filter(|key| !expected.contains_key(*key))
        .cloned()
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        return Ok(());
    }
    if strict {
        return Err(EngineError::StateMismatch {
            missing,
            unexpected,
        });
    }
    debug!(?missing, ?unexpected, "Ignoring state key mismatch");
    Ok(())
}
