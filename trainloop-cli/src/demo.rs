//! A tiny mean-estimation engine used by `trainloop run`.
//!
//! The model holds one parameter that SGD pulls toward the mean of a
//! synthetic, noisy sample stream. Parameters are shared between model and
//! optimizer through `Rc<Param>`, the same way framework optimizers hold
//! references to model tensors.

use serde_json::{Value, json};
use std::cell::Cell;
use std::rc::Rc;
use tracing::info;

use trainloop_core::{
    Device, DeviceTensor, Engine, EngineError, EngineResult, HookRegistry, HyperParameters,
    HyperParametersBuilder, Model, Optimizer, Scheduler, StateDict, StateSlot, Stateful,
    TrainingConfig, check_state_keys,
};

const DEFAULT_LR: f64 = 0.1;
const DEFAULT_TARGET: f64 = 3.0;
const DEFAULT_SAMPLES: u64 = 64;

/// A scalar parameter with its gradient.
#[derive(Debug, Default)]
pub struct Param {
    value: Cell<f64>,
    grad: Cell<f64>,
}

#[derive(Debug, Default)]
pub struct MeanModel {
    param: Rc<Param>,
    training: bool,
    device: Device,
}

impl MeanModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mean(&self) -> f64 {
        self.param.value.get()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Squared error against `sample`; accumulates the gradient scaled by `scale`.
    fn backward(&self, sample: f64, scale: f64) -> f64 {
        let diff = self.param.value.get() - sample;
        self.param.grad.set(self.param.grad.get() + 2.0 * diff * scale);
        diff * diff
    }
}

impl Model for MeanModel {
    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("mean".into(), json!(self.mean()));
        state
    }

    fn load_state_dict(&mut self, state: StateDict, strict: bool) -> EngineResult<()> {
        check_state_keys(&self.state_dict(), &state, strict)?;
        if let Some(value) = state.get("mean") {
            let mean = value
                .as_f64()
                .ok_or_else(|| EngineError::invalid_value("mean", "expected a number"))?;
            self.param.value.set(mean);
        }
        Ok(())
    }

    fn to_device(&mut self, device: Device) -> EngineResult<()> {
        self.device = device;
        Ok(())
    }
}

/// Optimizer-owned buffer that follows the model across devices.
#[derive(Debug, Default)]
pub struct Buffer {
    value: f64,
    device: Device,
}

impl DeviceTensor for Buffer {
    fn to_device(&mut self, device: Device) {
        self.device = device;
    }
}

/// SGD with momentum. The learning rate is shared with the scheduler.
#[derive(Debug)]
pub struct Sgd {
    param: Rc<Param>,
    lr: Rc<Cell<f64>>,
    momentum: f64,
    velocity: Buffer,
    steps: u64,
}

impl Sgd {
    pub fn new(model: &MeanModel, lr: Rc<Cell<f64>>, momentum: f64) -> Self {
        Self {
            param: Rc::clone(&model.param),
            lr,
            momentum,
            velocity: Buffer::default(),
            steps: 0,
        }
    }
}

impl Stateful for Sgd {
    fn state_dict(&self) -> Value {
        json!({
            "lr": self.lr.get(),
            "momentum": self.momentum,
            "velocity": self.velocity.value,
            "device": self.velocity.device,
            "steps": self.steps,
        })
    }

    fn load_state_dict(&mut self, state: Value) -> EngineResult<()> {
        let number = |key: &str| {
            state[key]
                .as_f64()
                .ok_or_else(|| EngineError::invalid_value(key, "missing from optimizer state"))
        };
        self.lr.set(number("lr")?);
        self.momentum = number("momentum")?;
        self.velocity.value = number("velocity")?;
        self.steps = state["steps"].as_u64().unwrap_or_default();
        Ok(())
    }

    fn state_slots(&mut self) -> Vec<StateSlot<'_>> {
        vec![StateSlot::Tensor(&mut self.velocity)]
    }
}

impl Optimizer for Sgd {
    fn step(&mut self) -> EngineResult<()> {
        self.velocity.value = self.momentum * self.velocity.value + self.param.grad.get();
        let value = self.param.value.get() - self.lr.get() * self.velocity.value;
        self.param.value.set(value);
        self.steps += 1;
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.param.grad.set(0.0);
    }
}

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug)]
pub struct StepLr {
    lr: Rc<Cell<f64>>,
    step_size: u64,
    gamma: f64,
    last_epoch: u64,
}

impl StepLr {
    pub fn new(lr: Rc<Cell<f64>>, step_size: u64, gamma: f64) -> Self {
        Self {
            lr,
            step_size: step_size.max(1),
            gamma,
            last_epoch: 0,
        }
    }
}

impl Stateful for StepLr {
    fn state_dict(&self) -> Value {
        json!({
            "step_size": self.step_size,
            "gamma": self.gamma,
            "last_epoch": self.last_epoch,
        })
    }

    fn load_state_dict(&mut self, state: Value) -> EngineResult<()> {
        self.step_size = state["step_size"].as_u64().unwrap_or(self.step_size).max(1);
        self.gamma = state["gamma"].as_f64().unwrap_or(self.gamma);
        self.last_epoch = state["last_epoch"].as_u64().unwrap_or_default();
        Ok(())
    }
}

impl Scheduler for StepLr {
    fn step(&mut self) -> EngineResult<()> {
        self.last_epoch += 1;
        if self.last_epoch % self.step_size == 0 {
            self.lr.set(self.lr.get() * self.gamma);
        }
        Ok(())
    }
}

/// Fits [`MeanModel`] to the synthetic sample stream.
pub struct MeanEngine {
    params: HyperParameters<MeanModel>,
    max_epochs: Option<u64>,
    done: bool,
    loss: f64,
    seen: usize,
}

impl MeanEngine {
    pub fn from_config(config: &TrainingConfig) -> EngineResult<Self> {
        let lr = Rc::new(Cell::new(number_field(config, "lr", DEFAULT_LR)));
        let model = MeanModel::new();
        let sgd = Sgd::new(&model, Rc::clone(&lr), number_field(config, "momentum", 0.0));
        let step_size = config
            .fields
            .get("lr_step")
            .and_then(Value::as_u64)
            .unwrap_or(10);
        let gamma = number_field(config, "lr_gamma", 0.5);

        let params = HyperParametersBuilder::from_config(model, config)
            .optimizer(sgd)
            .scheduler(StepLr::new(lr, step_size, gamma))
            .build()?;
        Ok(Self {
            params,
            max_epochs: config.max_epochs,
            done: false,
            loss: 0.0,
            seen: 0,
        })
    }

    pub fn mean(&self) -> f64 {
        self.params.model().mean()
    }
}

impl Engine for MeanEngine {
    type Model = MeanModel;
    type Loader = Vec<f64>;

    fn params(&self) -> &HyperParameters<MeanModel> {
        &self.params
    }

    fn params_mut(&mut self) -> &mut HyperParameters<MeanModel> {
        &mut self.params
    }

    fn hooks() -> HookRegistry<Self> {
        let mut hooks = HookRegistry::new();
        hooks.on_epoch_end(1, |engine: &mut Self| {
            let epoch = engine.params.epoch;
            let loss = engine.loss / engine.seen.max(1) as f64;
            info!(epoch, loss, mean = engine.mean(), "Epoch finished");
            engine.loss = 0.0;
            engine.seen = 0;
            engine.done = engine.max_epochs.is_some_and(|max| epoch >= max);
            engine.params.scheduler_mut()?.step()
        });
        hooks
    }

    fn start(&mut self) -> EngineResult<Option<Vec<f64>>> {
        self.done = false;
        Ok(None)
    }

    fn process_batch(&mut self, sample: f64) -> EngineResult<()> {
        let scale = 1.0 / self.params.batch_subdivisions() as f64;
        self.loss += self.params.model().backward(sample, scale);
        self.seen += 1;
        Ok(())
    }

    fn train_batch(&mut self) -> EngineResult<()> {
        let optimizer = self.params.optimizer_mut()?;
        optimizer.step()?;
        optimizer.zero_grad();
        Ok(())
    }

    fn quit(&mut self) -> bool {
        self.done
    }
}

/// Noisy samples around `target`, identical on every call.
pub fn synthetic_samples(config: &TrainingConfig) -> Vec<f64> {
    let target = number_field(config, "target", DEFAULT_TARGET);
    let count = config
        .fields
        .get("samples")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_SAMPLES);
    (0..count)
        .map(|i| target + (i as f64 * 1.7).sin())
        .collect()
}

fn number_field(config: &TrainingConfig, name: &str, default: f64) -> f64 {
    config
        .fields
        .get(name)
        .and_then(Value::as_f64)
        .unwrap_or(default)
}
