//! Property-based tests for batch geometry, hook dispatch and the loop.

use proptest::prelude::*;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use trainloop_core::{
    Device, Engine, EngineError, EngineResult, Hook, HookRegistry, HookTable, HyperParameters,
    Model, StateDict, Trainer,
};

#[derive(Default)]
struct Null {
    training: bool,
}

impl Model for Null {
    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn state_dict(&self) -> StateDict {
        StateDict::new()
    }

    fn load_state_dict(&mut self, _state: StateDict, _strict: bool) -> EngineResult<()> {
        Ok(())
    }

    fn to_device(&mut self, _device: Device) -> EngineResult<()> {
        Ok(())
    }
}

struct Tally {
    params: HyperParameters<Null>,
    processed: usize,
    steps: usize,
    epochs: u64,
}

impl Engine for Tally {
    type Model = Null;
    type Loader = Vec<Value>;

    fn params(&self) -> &HyperParameters<Null> {
        &self.params
    }

    fn params_mut(&mut self) -> &mut HyperParameters<Null> {
        &mut self.params
    }

    fn hooks() -> HookRegistry<Self> {
        let mut hooks = HookRegistry::new();
        hooks.on_epoch_end(1, |engine: &mut Self| {
            engine.epochs += 1;
            Ok(())
        });
        hooks
    }

    fn process_batch(&mut self, _data: Value) -> EngineResult<()> {
        self.processed += 1;
        Ok(())
    }

    fn train_batch(&mut self) -> EngineResult<()> {
        self.steps += 1;
        Ok(())
    }

    fn quit(&mut self) -> bool {
        self.epochs >= 1
    }
}

fn params(batch_size: usize, mini_batch_size: usize) -> EngineResult<HyperParameters<Null>> {
    HyperParameters::builder(Null::default())
        .batch_size(batch_size)
        .mini_batch_size(mini_batch_size)
        .build()
}

// --- Batch geometry ---

proptest! {
    #[test]
    fn construction_fails_only_for_non_divisors(batch in 1usize..128, mini in 1usize..160) {
        let result = params(batch, mini);
        let expect_err = mini <= batch && batch % mini != 0;
        prop_assert_eq!(result.is_err(), expect_err);
        if let Err(err) = result {
            let is_batch_size_error = matches!(err, EngineError::InvalidBatchSize { .. });
            prop_assert!(is_batch_size_error);
        }
    }

    #[test]
    fn subdivisions_times_mini_is_batch(batch in 1usize..128, mini in 1usize..160) {
        if let Ok(p) = params(batch, mini) {
            prop_assert!(p.batch_subdivisions() >= 1);
            prop_assert_eq!(p.batch_subdivisions() * p.mini_batch_size(), p.batch_size());
        }
    }
}

// --- Hook dispatch ---

proptest! {
    #[test]
    fn hook_fires_iff_interval_divides(interval in 1u64..50, value in 0u64..1_000) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut table: HookTable<()> = HookTable::new();
        let counter = Arc::clone(&calls);
        table.register(interval, Hook::bound(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let fired = table.dispatch(value, &mut ()).unwrap();
        let expected = usize::from(value % interval == 0);
        prop_assert_eq!(fired, expected);
        prop_assert_eq!(calls.load(Ordering::SeqCst), expected);
    }

    #[test]
    fn every_hook_under_an_interval_fires(hooks in 1usize..10, value in 1u64..100) {
        let mut table: HookTable<usize> = HookTable::new();
        for _ in 0..hooks {
            table.register(1, Hook::free(|n: &mut usize| {
                *n += 1;
                Ok(())
            }));
        }
        let mut count = 0usize;
        prop_assert_eq!(table.dispatch(value, &mut count).unwrap(), hooks);
        prop_assert_eq!(count, hooks);
    }
}

// --- Loop ---

proptest! {
    #[test]
    fn one_epoch_steps_once_per_full_batch(
        subdivisions in 1usize..6,
        mini in 1usize..4,
        len in 1usize..40,
    ) {
        let batch_size = subdivisions * mini;
        let engine = Tally {
            params: params(batch_size, mini).unwrap(),
            processed: 0,
            steps: 0,
            epochs: 0,
        };
        let mut trainer = Trainer::new(engine, Some(vec![Value::Null; len]));
        trainer.run().unwrap();

        let engine = trainer.engine();
        prop_assert_eq!(engine.params.epoch, 1);
        prop_assert_eq!(engine.steps, len / subdivisions);
        prop_assert!(
            engine.processed == len || engine.processed == engine.steps * subdivisions
        );
    }
}
