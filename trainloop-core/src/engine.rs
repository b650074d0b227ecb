//! The training loop.
//!
//! An [`Engine`] supplies the numeric work of one training session: how to
//! process a mini-batch and how to apply the accumulated update. A [`Trainer`]
//! drives it through epochs and batches:
//!
//! 1. Every epoch increments `epoch` and fires the epoch-start hooks.
//! 2. Every mini-batch increments `batch`, fires the batch-start hooks and is
//!    handed to [`Engine::process_batch`].
//! 3. Only once `batch_subdivisions` mini-batches have been processed does the
//!    logical batch complete: [`Engine::train_batch`] runs, the batch-end hooks
//!    fire and the stop conditions are checked. Until then the batch counter is
//!    rolled back so hooks always see logical batch numbers.
//! 4. Trailing mini-batches that cannot fill a whole logical batch are skipped.
//! 5. The epoch-end hooks fire and the stop conditions are checked again.
//!
//! Stopping is cooperative: [`Engine::quit`] and the [`Interrupt`] flag are
//! only consulted at those two checkpoints, never mid-accumulation.

use serde_json::Value;
use tracing::{info, warn};

use crate::bridge::AttributeBridge;
use crate::data::DataLoader;
use crate::error::{EngineError, EngineResult};
use crate::hooks::{HookPoint, HookRegistry};
use crate::interrupt::Interrupt;
use crate::model::Model;
use crate::params::HyperParameters;

/// Trainer-native attribute exposing the interrupt flag.
const INTERRUPTED: &str = "interrupted";

/// The numeric side of a training session.
pub trait Engine {
    type Model: Model;
    type Loader: DataLoader;

    fn params(&self) -> &HyperParameters<Self::Model>;

    fn params_mut(&mut self) -> &mut HyperParameters<Self::Model>;

    /// Hooks shared by every trainer of this engine type.
    fn hooks() -> HookRegistry<Self>
    where
        Self: Sized,
    {
        HookRegistry::new()
    }

    /// Called once before the loop begins. A returned loader replaces the
    /// trainer's current one.
    fn start(&mut self) -> EngineResult<Option<Self::Loader>> {
        Ok(None)
    }

    /// Forward and backward pass for one mini-batch.
    fn process_batch(&mut self, data: <Self::Loader as DataLoader>::Batch) -> EngineResult<()>;

    /// Apply the update accumulated over one logical batch.
    fn train_batch(&mut self) -> EngineResult<()>;

    /// Whether training should stop. Checked after every logical batch and
    /// every epoch, before the interrupt flag.
    fn quit(&mut self) -> bool {
        false
    }
}

/// Why [`Trainer::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`Engine::quit`] returned `true`.
    Quit,
    /// The interrupt flag was raised.
    Interrupted,
}

/// Drives an [`Engine`] through the training loop.
pub struct Trainer<E: Engine> {
    engine: E,
    loader: Option<E::Loader>,
    hooks: HookRegistry<E>,
    interrupt: Interrupt,
    attributes: AttributeBridge,
}

impl<E: Engine> Trainer<E> {
    /// Create a trainer starting from the engine type's declared hooks.
    ///
    /// Ctrl-C is not captured until the caller runs
    /// [`install_interrupt_handler`](Self::install_interrupt_handler). Before that the
    /// flag is only raised through [`Interrupt::trigger`].
    pub fn new(engine: E, loader: Option<E::Loader>) -> Self {
        if loader.is_none() {
            warn!(
                "No dataloader given, make sure Engine::start returns one for this trainer to work with"
            );
        }
        Self {
            engine,
            loader,
            hooks: E::hooks(),
            interrupt: Interrupt::new(),
            attributes: AttributeBridge::new(),
        }
    }

    /// Attach a trainer-local attribute.
    ///
    /// Names that already resolve on the trainer or its hyperparameters are
    /// skipped with a warning.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if name == INTERRUPTED {
            warn!(attribute = name.as_str(), "Attribute already exists on engine");
            return self;
        }
        self.attributes.init(self.engine.params(), name, value.into());
        self
    }

    /// Share an existing interrupt flag instead of a fresh one.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn set_dataloader(&mut self, loader: E::Loader) {
        self.loader = Some(loader);
    }

    pub fn dataloader(&self) -> Option<&E::Loader> {
        self.loader.as_ref()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    pub fn params(&self) -> &HyperParameters<E::Model> {
        self.engine.params()
    }

    pub fn params_mut(&mut self) -> &mut HyperParameters<E::Model> {
        self.engine.params_mut()
    }

    pub fn hooks(&self) -> &HookRegistry<E> {
        &self.hooks
    }

    /// Hooks for this trainer only, on top of the declared ones.
    pub fn hooks_mut(&mut self) -> &mut HookRegistry<E> {
        &mut self.hooks
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    /// Turn Ctrl-C into a graceful stop at the next checkpoint.
    pub fn install_interrupt_handler(&self) -> EngineResult<()> {
        self.interrupt.install_ctrl_c_handler()
    }

    /// Read an attribute from the trainer or, failing that, the hyperparameters.
    pub fn get(&self, name: &str) -> EngineResult<Value> {
        if name == INTERRUPTED {
            return Ok(Value::Bool(self.interrupt.is_set()));
        }
        self.attributes.get(self.engine.params(), name)
    }

    /// Write an attribute. Names owned by the hyperparameters are forwarded there.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> EngineResult<()> {
        let value = value.into();
        if name == INTERRUPTED {
            return match value {
                Value::Bool(true) => {
                    self.interrupt.trigger();
                    Ok(())
                }
                _ => Err(EngineError::invalid_value(
                    name,
                    "the interrupt flag can only be raised",
                )),
            };
        }
        self.attributes.set(self.engine.params_mut(), name, value)
    }

    /// Log a message tagged with the model's current mode (`train` or `test`).
    pub fn log(&self, msg: impl AsRef<str>) {
        let params = self.engine.params();
        let mode = if params.model().is_training() {
            "train"
        } else {
            "test"
        };
        info!(
            mode,
            epoch = params.epoch,
            batch = params.batch,
            "{}",
            msg.as_ref()
        );
    }

    /// Run the training loop until the engine quits or an interrupt arrives.
    pub fn run(&mut self) -> EngineResult<StopReason> {
        if let Some(loader) = self.engine.start()? {
            self.loader = Some(loader);
        }
        let mut loader = self.loader.take().ok_or(EngineError::NoDataLoader)?;
        let outcome = self.train(&mut loader);
        self.loader = Some(loader);
        outcome
    }

    fn train(&mut self, loader: &mut E::Loader) -> EngineResult<StopReason> {
        let params = self.engine.params();
        info!(
            batch_size = params.batch_size(),
            mini_batch_size = params.mini_batch_size(),
            "Start training"
        );
        self.engine.params_mut().model_mut().train();

        loop {
            let epoch = {
                let params = self.engine.params_mut();
                params.epoch += 1;
                params.epoch
            };
            self.hooks
                .dispatch(HookPoint::EpochStart, epoch, &mut self.engine)?;

            let len = loader.len();
            for (idx, data) in loader.batches().enumerate() {
                let batch = {
                    let params = self.engine.params_mut();
                    params.batch += 1;
                    params.batch
                };
                self.hooks
                    .dispatch(HookPoint::BatchStart, batch, &mut self.engine)?;

                self.engine.process_batch(data)?;
                let subdivisions = self.subdivisions()?;
                if (idx + 1) % subdivisions != 0 {
                    let params = self.engine.params_mut();
                    params.batch = params.batch.saturating_sub(1);
                    continue;
                }

                self.engine.train_batch()?;
                let batch = self.engine.params().batch;
                self.hooks
                    .dispatch(HookPoint::BatchEnd, batch, &mut self.engine)?;

                if let Some(reason) = self.stop_reason() {
                    info!(epoch, batch, ?reason, "Reached quitting criteria");
                    return Ok(reason);
                }

                if len.saturating_sub(idx) <= subdivisions {
                    break;
                }
            }

            let epoch = self.engine.params().epoch;
            self.hooks
                .dispatch(HookPoint::EpochEnd, epoch, &mut self.engine)?;

            if let Some(reason) = self.stop_reason() {
                info!(epoch, ?reason, "Reached quitting criteria");
                return Ok(reason);
            }
        }
    }

    fn subdivisions(&self) -> EngineResult<usize> {
        match self.engine.params().batch_subdivisions() {
            0 => Err(EngineError::config(
                "mini_batch_size exceeds batch_size, no mini-batch forms a full batch",
            )),
            n => Ok(n),
        }
    }

    fn stop_reason(&mut self) -> Option<StopReason> {
        if self.engine.quit() {
            Some(StopReason::Quit)
        } else if self.interrupt.is_set() {
            Some(StopReason::Interrupted)
        } else {
            None
        }
    }
}
