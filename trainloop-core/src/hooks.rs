//! Interval-keyed hooks for the training loop.
//!
//! A [`HookRegistry`] holds four tables, one per [`HookPoint`]. Each table maps
//! an interval to the hooks registered under it; a hook fires whenever the
//! relevant counter (epoch or batch) is a multiple of its interval.
//!
//! Firing order is deterministic: intervals are visited in the order they were
//! first registered, and hooks sharing an interval fire in registration order.
//! With hooks at intervals `2` then `1`, epoch 4 fires the interval-2 hooks
//! before the interval-1 hooks.
//!
//! Registries are plain values. An engine type declares its hooks once in
//! [`Engine::hooks`](crate::engine::Engine::hooks) and every trainer built for
//! that type starts from a clone of that registry.

use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::error::EngineResult;

/// Callback receiving the engine it was dispatched for.
pub type FreeHookFn<E> = Arc<dyn Fn(&mut E) -> EngineResult<()> + Send + Sync>;

/// Callback bound to its own receiver; takes no arguments.
pub type BoundHookFn = Arc<dyn Fn() -> EngineResult<()> + Send + Sync>;

/// A registered callback.
pub enum Hook<E> {
    /// Carries its own receiver, invoked with no arguments.
    Bound(BoundHookFn),
    /// Invoked with the engine as its sole argument.
    Free(FreeHookFn<E>),
}

impl<E> Hook<E> {
    pub fn free(f: impl Fn(&mut E) -> EngineResult<()> + Send + Sync + 'static) -> Self {
        Hook::Free(Arc::new(f))
    }

    pub fn bound(f: impl Fn() -> EngineResult<()> + Send + Sync + 'static) -> Self {
        Hook::Bound(Arc::new(f))
    }

    fn call(&self, engine: &mut E) -> EngineResult<()> {
        match self {
            Hook::Bound(f) => f(),
            Hook::Free(f) => f(engine),
        }
    }
}

impl<E> Clone for Hook<E> {
    fn clone(&self) -> Self {
        match self {
            Hook::Bound(f) => Hook::Bound(Arc::clone(f)),
            Hook::Free(f) => Hook::Free(Arc::clone(f)),
        }
    }
}

impl<E> fmt::Debug for Hook<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Bound(_) => f.write_str("Hook::Bound"),
            Hook::Free(_) => f.write_str("Hook::Free"),
        }
    }
}

/// Where in the training loop a table is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    EpochStart,
    EpochEnd,
    BatchStart,
    BatchEnd,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::EpochStart => "epoch_start",
            HookPoint::EpochEnd => "epoch_end",
            HookPoint::BatchStart => "batch_start",
            HookPoint::BatchEnd => "batch_end",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interval → hooks, in first-insertion order of intervals.
pub struct HookTable<E> {
    entries: IndexMap<u64, Vec<Hook<E>>>,
}

impl<E> HookTable<E> {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    /// Append `hook` under `interval`. Entries are never removed.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is 0.
    pub fn register(&mut self, interval: u64, hook: Hook<E>) {
        assert!(interval != 0, "hook interval must be positive");
        self.entries.entry(interval).or_default().push(hook);
    }

    /// Run every hook whose interval divides `value`. Returns how many fired.
    pub fn dispatch(&self, value: u64, engine: &mut E) -> EngineResult<usize> {
        let mut fired = 0;
        for (interval, hooks) in &self.entries {
            if value % interval != 0 {
                continue;
            }
            for hook in hooks {
                hook.call(engine)?;
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Registered intervals, in dispatch order.
    pub fn intervals(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for HookTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for HookTable<E> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

/// The four hook tables of an engine type.
pub struct HookRegistry<E> {
    epoch_start: HookTable<E>,
    epoch_end: HookTable<E>,
    batch_start: HookTable<E>,
    batch_end: HookTable<E>,
}

impl<E> HookRegistry<E> {
    pub fn new() -> Self {
        Self {
            epoch_start: HookTable::new(),
            epoch_end: HookTable::new(),
            batch_start: HookTable::new(),
            batch_end: HookTable::new(),
        }
    }

    pub fn table(&self, point: HookPoint) -> &HookTable<E> {
        match point {
            HookPoint::EpochStart => &self.epoch_start,
            HookPoint::EpochEnd => &self.epoch_end,
            HookPoint::BatchStart => &self.batch_start,
            HookPoint::BatchEnd => &self.batch_end,
        }
    }

    fn table_mut(&mut self, point: HookPoint) -> &mut HookTable<E> {
        match point {
            HookPoint::EpochStart => &mut self.epoch_start,
            HookPoint::EpochEnd => &mut self.epoch_end,
            HookPoint::BatchStart => &mut self.batch_start,
            HookPoint::BatchEnd => &mut self.batch_end,
        }
    }

    /// Register `hook` at `point` every `interval` counts.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is 0.
    pub fn register(&mut self, point: HookPoint, interval: u64, hook: Hook<E>) -> &mut Self {
        self.table_mut(point).register(interval, hook);
        self
    }

    pub fn on_epoch_start(
        &mut self,
        interval: u64,
        f: impl Fn(&mut E) -> EngineResult<()> + Send + Sync + 'static,
    ) -> &mut Self {
        self.register(HookPoint::EpochStart, interval, Hook::free(f))
    }

    pub fn on_epoch_end(
        &mut self,
        interval: u64,
        f: impl Fn(&mut E) -> EngineResult<()> + Send + Sync + 'static,
    ) -> &mut Self {
        self.register(HookPoint::EpochEnd, interval, Hook::free(f))
    }

    pub fn on_batch_start(
        &mut self,
        interval: u64,
        f: impl Fn(&mut E) -> EngineResult<()> + Send + Sync + 'static,
    ) -> &mut Self {
        self.register(HookPoint::BatchStart, interval, Hook::free(f))
    }

    pub fn on_batch_end(
        &mut self,
        interval: u64,
        f: impl Fn(&mut E) -> EngineResult<()> + Send + Sync + 'static,
    ) -> &mut Self {
        self.register(HookPoint::BatchEnd, interval, Hook::free(f))
    }

    /// Fire the hooks of `point` for counter `value`.
    pub fn dispatch(&self, point: HookPoint, value: u64, engine: &mut E) -> EngineResult<usize> {
        let fired = self.table(point).dispatch(value, engine)?;
        if fired > 0 {
            trace!(point = point.as_str(), value, fired, "Dispatched hooks");
        }
        Ok(fired)
    }

    /// Total number of registered hooks.
    pub fn count(&self) -> usize {
        self.epoch_start.len()
            + self.epoch_end.len()
            + self.batch_start.len()
            + self.batch_end.len()
    }
}

impl<E> Default for HookRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for HookRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            epoch_start: self.epoch_start.clone(),
            epoch_end: self.epoch_end.clone(),
            batch_start: self.batch_start.clone(),
            batch_end: self.batch_end.clone(),
        }
    }
}
