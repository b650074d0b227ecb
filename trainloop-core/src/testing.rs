//! Minimal collaborators shared by unit tests.

use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::EngineResult;
use crate::model::{Device, Model, Optimizer, StateDict, Stateful, check_state_keys};

#[derive(Debug, Default)]
pub(crate) struct Scalar {
    pub weight: f64,
    pub training: bool,
    pub device: Device,
}

impl Model for Scalar {
    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("weight".into(), json!(self.weight));
        state
    }

    fn load_state_dict(&mut self, state: StateDict, strict: bool) -> EngineResult<()> {
        check_state_keys(&self.state_dict(), &state, strict)?;
        if let Some(weight) = state.get("weight").and_then(Value::as_f64) {
            self.weight = weight;
        }
        Ok(())
    }

    fn to_device(&mut self, device: Device) -> EngineResult<()> {
        self.device = device;
        Ok(())
    }
}

/// Optimizer that only counts its steps.
#[derive(Debug, Default, Clone)]
pub(crate) struct CountingOptimizer {
    pub steps: Arc<AtomicUsize>,
}

impl CountingOptimizer {
    pub fn count(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }
}

impl Stateful for CountingOptimizer {
    fn state_dict(&self) -> Value {
        json!({ "steps": self.count() })
    }

    fn load_state_dict(&mut self, state: Value) -> EngineResult<()> {
        let steps = state["steps"].as_u64().unwrap_or(0) as usize;
        self.steps.store(steps, Ordering::SeqCst);
        Ok(())
    }
}

impl Optimizer for CountingOptimizer {
    fn step(&mut self) -> EngineResult<()> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
