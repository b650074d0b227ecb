//! Hyperparameter container for a training session.
//!
//! [`HyperParameters`] owns the model, its optimizers and schedulers, the
//! batch geometry and the epoch/batch counters, plus any number of extra
//! user-defined fields. The whole container can be saved to a single record
//! and restored later to resume a run.
//!
//! Extra fields whose name starts with [`EXCLUDE_PREFIX`] are stored without
//! the prefix and are never written to a record.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, warn};

use crate::config::TrainingConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{Device, Model, Optimizer, Scheduler, StateDict, migrate_slots};
use crate::persistence::{self, Record};

/// Marks an extra field as not serializable.
pub const EXCLUDE_PREFIX: char = '_';

const MODEL_KEY: &str = "model";
const OPTIMIZERS_KEY: &str = "optimizers";
const SCHEDULERS_KEY: &str = "schedulers";

/// Names that resolve to objects rather than plain values.
const OBJECT_FIELDS: [&str; 5] = ["model", "optimizers", "schedulers", "optimizer", "scheduler"];

/// Plain-valued built-in fields.
const VALUE_FIELDS: [&str; 5] = [
    "batch_size",
    "mini_batch_size",
    "batch",
    "epoch",
    "batch_subdivisions",
];

/// Training hyperparameters and state of one session.
pub struct HyperParameters<M> {
    model: M,
    optimizers: Option<Vec<Box<dyn Optimizer>>>,
    schedulers: Option<Vec<Box<dyn Scheduler>>>,
    batch_size: usize,
    mini_batch_size: usize,
    /// Number of optimizer steps taken so far.
    pub batch: u64,
    /// Number of epochs started so far.
    pub epoch: u64,
    fields: BTreeMap<String, Value>,
    no_serialize: BTreeSet<String>,
}

impl<M: Model> HyperParameters<M> {
    pub fn builder(model: M) -> HyperParametersBuilder<M> {
        HyperParametersBuilder::new(model)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// The first optimizer.
    pub fn optimizer(&self) -> EngineResult<&dyn Optimizer> {
        self.optimizers
            .as_deref()
            .and_then(<[_]>::first)
            .map(|o| &**o)
            .ok_or(EngineError::MissingComponent { what: "optimizer" })
    }

    pub fn optimizer_mut(&mut self) -> EngineResult<&mut dyn Optimizer> {
        match self.optimizers.as_deref_mut().and_then(<[_]>::first_mut) {
            Some(optimizer) => Ok(optimizer.as_mut()),
            None => Err(EngineError::MissingComponent { what: "optimizer" }),
        }
    }

    /// The first scheduler.
    pub fn scheduler(&self) -> EngineResult<&dyn Scheduler> {
        self.schedulers
            .as_deref()
            .and_then(<[_]>::first)
            .map(|s| &**s)
            .ok_or(EngineError::MissingComponent { what: "scheduler" })
    }

    pub fn scheduler_mut(&mut self) -> EngineResult<&mut dyn Scheduler> {
        match self.schedulers.as_deref_mut().and_then(<[_]>::first_mut) {
            Some(scheduler) => Ok(scheduler.as_mut()),
            None => Err(EngineError::MissingComponent { what: "scheduler" }),
        }
    }

    /// All optimizers; empty when none were configured.
    pub fn optimizers_mut(&mut self) -> &mut [Box<dyn Optimizer>] {
        self.optimizers.as_deref_mut().unwrap_or_default()
    }

    pub fn schedulers_mut(&mut self) -> &mut [Box<dyn Scheduler>] {
        self.schedulers.as_deref_mut().unwrap_or_default()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn mini_batch_size(&self) -> usize {
        self.mini_batch_size
    }

    /// Mini-batches accumulated per optimizer step.
    pub fn batch_subdivisions(&self) -> usize {
        self.batch_size / self.mini_batch_size
    }

    /// Whether `name` resolves to anything on this container.
    pub fn has(&self, name: &str) -> bool {
        OBJECT_FIELDS.contains(&name)
            || VALUE_FIELDS.contains(&name)
            || self.fields.contains_key(name)
    }

    /// Extra field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Whether `name` is written to saved records.
    pub fn is_serialized(&self, name: &str) -> bool {
        match name {
            "batch_size" | "mini_batch_size" | "batch" | "epoch" => true,
            _ => self.fields.contains_key(name) && !self.no_serialize.contains(name),
        }
    }

    /// Read a plain-valued field.
    pub fn get(&self, name: &str) -> EngineResult<Value> {
        match name {
            "batch_size" => Ok(self.batch_size.into()),
            "mini_batch_size" => Ok(self.mini_batch_size.into()),
            "batch" => Ok(self.batch.into()),
            "epoch" => Ok(self.epoch.into()),
            "batch_subdivisions" => Ok(self.batch_subdivisions().into()),
            _ if OBJECT_FIELDS.contains(&name) => Err(EngineError::invalid_value(
                name,
                "not a plain value, use the typed accessor",
            )),
            _ => self
                .fields
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::unknown_attribute(name)),
        }
    }

    /// Overwrite a field, creating an extra field if `name` is unknown.
    ///
    /// Built-in fields only accept values of their own type. The batch
    /// geometry is not re-validated here.
    pub fn set(&mut self, name: &str, value: Value) -> EngineResult<()> {
        match name {
            "batch_size" => self.batch_size = positive(name, &value)?,
            "mini_batch_size" => self.mini_batch_size = positive(name, &value)?,
            "batch" => self.batch = counter(name, &value)?,
            "epoch" => self.epoch = counter(name, &value)?,
            _ if name == "batch_subdivisions" || OBJECT_FIELDS.contains(&name) => {
                return Err(EngineError::ReadOnlyAttribute { name: name.into() });
            }
            _ => {
                self.fields.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    fn insert_field(&mut self, key: String, value: Value) {
        let (name, serialize) = match key.strip_prefix(EXCLUDE_PREFIX) {
            Some(stripped) => (stripped.to_string(), false),
            None => (key, true),
        };

        if self.has(&name) {
            warn!(
                field = name.as_str(),
                "Attribute already exists as a hyperparameter and will not be overwritten"
            );
            return;
        }
        if !serialize {
            self.no_serialize.insert(name.clone());
        }
        self.fields.insert(name, value);
    }

    /// Write every serializable field plus model, optimizer and scheduler state to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        let mut record = Record::new();
        record.insert("batch_size".into(), self.batch_size.into());
        record.insert("mini_batch_size".into(), self.mini_batch_size.into());
        record.insert("batch".into(), self.batch.into());
        record.insert("epoch".into(), self.epoch.into());
        for (name, value) in &self.fields {
            if !self.no_serialize.contains(name) {
                record.insert(name.clone(), value.clone());
            }
        }

        record.insert(MODEL_KEY.into(), Value::Object(self.model.state_dict()));
        if let Some(optimizers) = &self.optimizers {
            let states = optimizers.iter().map(|o| o.state_dict()).collect();
            record.insert(OPTIMIZERS_KEY.into(), Value::Array(states));
        }
        if let Some(schedulers) = &self.schedulers {
            let states = schedulers.iter().map(|s| s.state_dict()).collect();
            record.insert(SCHEDULERS_KEY.into(), Value::Array(states));
        }

        persistence::write_record(path, &record)?;
        debug!(
            path = %path.display(),
            epoch = self.epoch,
            batch = self.batch,
            "Saved hyperparameters"
        );
        Ok(())
    }

    /// Restore state written by [`save`](Self::save).
    ///
    /// Every entry is checked before anything is written: a record with a
    /// malformed model state, too few snapshots or a badly typed built-in is
    /// rejected and the store stays as it was. Model state is restored first,
    /// then optimizers and schedulers by position, then every remaining entry
    /// overwrites the field of the same name. If an object rejects its
    /// snapshot, the objects already restored are rolled back.
    pub fn load(&mut self, path: impl AsRef<Path>, strict: bool) -> EngineResult<()> {
        let path = path.as_ref();
        let mut record = persistence::read_record(path)?;

        let model_state = match record.remove(MODEL_KEY) {
            Some(Value::Object(state)) => state,
            Some(_) => {
                return Err(EngineError::invalid_value(
                    MODEL_KEY,
                    "model state must be an object",
                ));
            }
            None => {
                return Err(EngineError::MissingRecordKey {
                    key: MODEL_KEY.into(),
                });
            }
        };

        let optimizer_states = record.remove(OPTIMIZERS_KEY);
        let optimizer_states = match &self.optimizers {
            Some(optimizers) => {
                Some(snapshots(OPTIMIZERS_KEY, optimizer_states, optimizers.len())?)
            }
            None => {
                if optimizer_states.is_some() {
                    debug!("Record holds optimizer state but no optimizers are configured");
                }
                None
            }
        };
        let scheduler_states = record.remove(SCHEDULERS_KEY);
        let scheduler_states = match &self.schedulers {
            Some(schedulers) => {
                Some(snapshots(SCHEDULERS_KEY, scheduler_states, schedulers.len())?)
            }
            None => {
                if scheduler_states.is_some() {
                    debug!("Record holds scheduler state but no schedulers are configured");
                }
                None
            }
        };

        let fields = FieldUpdate::parse(record)?;

        let backup = self.object_states();
        let restored = self.load_objects(model_state, strict, optimizer_states, scheduler_states);
        if let Err(err) = restored {
            self.restore_objects(backup);
            return Err(err);
        }
        fields.apply(self);

        debug!(
            path = %path.display(),
            epoch = self.epoch,
            batch = self.batch,
            "Loaded hyperparameters"
        );
        Ok(())
    }

    fn load_objects(
        &mut self,
        model_state: StateDict,
        strict: bool,
        optimizer_states: Option<Vec<Value>>,
        scheduler_states: Option<Vec<Value>>,
    ) -> EngineResult<()> {
        self.model.load_state_dict(model_state, strict)?;
        if let (Some(optimizers), Some(states)) = (self.optimizers.as_mut(), optimizer_states) {
            for (optimizer, state) in optimizers.iter_mut().zip(states) {
                optimizer.load_state_dict(state)?;
            }
        }
        if let (Some(schedulers), Some(states)) = (self.schedulers.as_mut(), scheduler_states) {
            for (scheduler, state) in schedulers.iter_mut().zip(states) {
                scheduler.load_state_dict(state)?;
            }
        }
        Ok(())
    }

    fn object_states(&self) -> ObjectStates {
        ObjectStates {
            model: self.model.state_dict(),
            optimizers: self
                .optimizers
                .iter()
                .flatten()
                .map(|o| o.state_dict())
                .collect(),
            schedulers: self
                .schedulers
                .iter()
                .flatten()
                .map(|s| s.state_dict())
                .collect(),
        }
    }

    fn restore_objects(&mut self, backup: ObjectStates) {
        let mut failed = self.model.load_state_dict(backup.model, false).is_err();
        for (optimizer, state) in self.optimizers.iter_mut().flatten().zip(backup.optimizers) {
            failed |= optimizer.load_state_dict(state).is_err();
        }
        for (scheduler, state) in self.schedulers.iter_mut().flatten().zip(backup.schedulers) {
            failed |= scheduler.load_state_dict(state).is_err();
        }
        if failed {
            warn!("Could not roll back every object after a rejected record");
        }
    }

    /// Move the model and all device-bound optimizer and scheduler state to `device`.
    ///
    /// Optimizer state is walked two levels deep (direct values and one nested
    /// mapping); scheduler attributes only one level.
    pub fn to(&mut self, device: Device) -> EngineResult<()> {
        self.model.to_device(device)?;

        let mut moved = 0;
        for optimizer in self.optimizers.iter_mut().flatten() {
            moved += migrate_slots(optimizer.state_slots(), device, 2);
        }
        for scheduler in self.schedulers.iter_mut().flatten() {
            moved += migrate_slots(scheduler.state_slots(), device, 1);
        }
        debug!(%device, tensors = moved, "Moved training state");
        Ok(())
    }
}

/// Object state captured before a load, used to undo a partial restore.
struct ObjectStates {
    model: StateDict,
    optimizers: Vec<Value>,
    schedulers: Vec<Value>,
}

/// Field values of a record, type checked before any of them is written.
#[derive(Default)]
struct FieldUpdate {
    batch_size: Option<usize>,
    mini_batch_size: Option<usize>,
    batch: Option<u64>,
    epoch: Option<u64>,
    extra: Vec<(String, Value)>,
}

impl FieldUpdate {
    fn parse(record: Record) -> EngineResult<Self> {
        let mut update = Self::default();
        for (name, value) in record {
            match name.as_str() {
                "batch_size" => update.batch_size = Some(positive(&name, &value)?),
                "mini_batch_size" => update.mini_batch_size = Some(positive(&name, &value)?),
                "batch" => update.batch = Some(counter(&name, &value)?),
                "epoch" => update.epoch = Some(counter(&name, &value)?),
                _ if name == "batch_subdivisions" || OBJECT_FIELDS.contains(&name.as_str()) => {
                    return Err(EngineError::ReadOnlyAttribute { name });
                }
                _ => update.extra.push((name, value)),
            }
        }
        Ok(update)
    }

    fn apply<M>(self, params: &mut HyperParameters<M>) {
        if let Some(v) = self.batch_size {
            params.batch_size = v;
        }
        if let Some(v) = self.mini_batch_size {
            params.mini_batch_size = v;
        }
        if let Some(v) = self.batch {
            params.batch = v;
        }
        if let Some(v) = self.epoch {
            params.epoch = v;
        }
        params.fields.extend(self.extra);
    }
}

fn snapshots(key: &str, states: Option<Value>, expected: usize) -> EngineResult<Vec<Value>> {
    match states {
        Some(Value::Array(states)) if states.len() >= expected => Ok(states),
        Some(Value::Array(states)) => Err(EngineError::invalid_value(
            key,
            format!("record holds {} snapshots for {expected} objects", states.len()),
        )),
        Some(_) => Err(EngineError::invalid_value(key, "expected a list of snapshots")),
        None => Err(EngineError::MissingRecordKey { key: key.into() }),
    }
}

fn positive(name: &str, value: &Value) -> EngineResult<usize> {
    value
        .as_u64()
        .filter(|v| *v > 0)
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| {
            EngineError::invalid_value(name, format!("expected a positive integer, got {value}"))
        })
}

fn counter(name: &str, value: &Value) -> EngineResult<u64> {
    value.as_u64().ok_or_else(|| {
        EngineError::invalid_value(name, format!("expected a non-negative integer, got {value}"))
    })
}

/// Builder for [`HyperParameters`].
pub struct HyperParametersBuilder<M> {
    model: M,
    optimizers: Option<Vec<Box<dyn Optimizer>>>,
    schedulers: Option<Vec<Box<dyn Scheduler>>>,
    batch_size: usize,
    mini_batch_size: Option<usize>,
    fields: Vec<(String, Value)>,
}

impl<M: Model> HyperParametersBuilder<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            optimizers: None,
            schedulers: None,
            batch_size: 1,
            mini_batch_size: None,
            fields: Vec::new(),
        }
    }

    /// Seed batch geometry and extra fields from a loaded configuration.
    pub fn from_config(model: M, config: &TrainingConfig) -> Self {
        let mut builder = Self::new(model).batch_size(config.batch_size);
        builder.mini_batch_size = config.mini_batch_size;
        builder.fields = config
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        builder
    }

    /// Append a single optimizer.
    pub fn optimizer(mut self, optimizer: impl Optimizer + 'static) -> Self {
        self.optimizers
            .get_or_insert_with(Vec::new)
            .push(Box::new(optimizer));
        self
    }

    pub fn optimizers(mut self, optimizers: Vec<Box<dyn Optimizer>>) -> Self {
        self.optimizers = Some(optimizers);
        self
    }

    /// Append a single scheduler.
    pub fn scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.schedulers
            .get_or_insert_with(Vec::new)
            .push(Box::new(scheduler));
        self
    }

    pub fn schedulers(mut self, schedulers: Vec<Box<dyn Scheduler>>) -> Self {
        self.schedulers = Some(schedulers);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn mini_batch_size(mut self, mini_batch_size: usize) -> Self {
        self.mini_batch_size = Some(mini_batch_size);
        self
    }

    /// Add an extra field. Prefix the name with `_` to keep it out of saved records.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn build(self) -> EngineResult<HyperParameters<M>> {
        let batch_size = self.batch_size;
        if batch_size == 0 {
            return Err(EngineError::config("batch_size must be positive"));
        }
        let mini_batch_size = match self.mini_batch_size {
            None => batch_size,
            Some(0) => return Err(EngineError::config("mini_batch_size must be positive")),
            Some(mini) if mini > batch_size => batch_size,
            Some(mini) if batch_size % mini != 0 => {
                return Err(EngineError::InvalidBatchSize {
                    batch_size,
                    mini_batch_size: mini,
                });
            }
            Some(mini) => mini,
        };

        let mut params = HyperParameters {
            model: self.model,
            optimizers: self.optimizers,
            schedulers: self.schedulers,
            batch_size,
            mini_batch_size,
            batch: 0,
            epoch: 0,
            fields: BTreeMap::new(),
            no_serialize: BTreeSet::new(),
        };
        for (key, value) in self.fields {
            params.insert_field(key, value);
        }
        Ok(params)
    }
}
