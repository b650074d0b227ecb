//! Flat attribute namespace over a trainer and its hyperparameters.
//!
//! Lookups check trainer-local attributes first and fall through to the
//! [`HyperParameters`]. Writes to a name the trainer does not own but the
//! hyperparameters do are forwarded, so callers never end up with a stale
//! shadow copy of a hyperparameter.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::model::Model;
use crate::params::HyperParameters;

/// Trainer-local attributes plus forwarding rules.
#[derive(Debug, Clone, Default)]
pub struct AttributeBridge {
    local: BTreeMap<String, Value>,
}

impl AttributeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construction-time write: always local, never forwarded.
    ///
    /// Names that already resolve (locally or on the hyperparameters) are left
    /// untouched. Returns whether the attribute was stored.
    pub fn init<M: Model>(
        &mut self,
        params: &HyperParameters<M>,
        name: impl Into<String>,
        value: Value,
    ) -> bool {
        let name = name.into();
        if self.local.contains_key(&name) || params.has(&name) {
            warn!(attribute = name.as_str(), "Attribute already exists on engine");
            return false;
        }
        self.local.insert(name, value);
        true
    }

    pub fn get<M: Model>(&self, params: &HyperParameters<M>, name: &str) -> EngineResult<Value> {
        if let Some(value) = self.local.get(name) {
            return Ok(value.clone());
        }
        if params.has(name) {
            return params.get(name);
        }
        Err(EngineError::unknown_attribute(name))
    }

    /// Write `name`, forwarding to the hyperparameters when they own it.
    pub fn set<M: Model>(
        &mut self,
        params: &mut HyperParameters<M>,
        name: &str,
        value: Value,
    ) -> EngineResult<()> {
        if !self.local.contains_key(name) && params.has(name) {
            return params.set(name, value);
        }
        self.local.insert(name.to_string(), value);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.local.contains_key(name)
    }

    /// Trainer-local attribute names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.local.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Scalar;
    use serde_json::json;

    fn params() -> HyperParameters<Scalar> {
        HyperParameters::builder(Scalar::default())
            .batch_size(4)
            .field("lr", 0.5)
            .build()
            .unwrap()
    }

    #[test]
    fn test_init_skips_existing_names() {
        let params = params();
        let mut bridge = AttributeBridge::new();
        assert!(bridge.init(&params, "tag", json!("a")));
        assert!(!bridge.init(&params, "tag", json!("b")));
        assert!(!bridge.init(&params, "lr", json!(1.0)));
        assert!(!bridge.init(&params, "epoch", json!(9)));

        assert_eq!(bridge.get(&params, "tag").unwrap(), json!("a"));
        assert_eq!(bridge.names().collect::<Vec<_>>(), vec!["tag"]);
    }

    #[test]
    fn test_set_forwards_owned_names() {
        let mut params = params();
        let mut bridge = AttributeBridge::new();
        bridge.set(&mut params, "lr", json!(0.25)).unwrap();
        bridge.set(&mut params, "batch", json!(3)).unwrap();
        bridge.set(&mut params, "scratch", json!([1, 2])).unwrap();

        assert!(!bridge.contains("lr"));
        assert_eq!(params.get("lr").unwrap(), json!(0.25));
        assert_eq!(params.batch, 3);
        assert!(bridge.contains("scratch"));
        assert!(!params.has("scratch"));
    }

    #[test]
    fn test_forwarded_errors_surface() {
        let mut params = params();
        let mut bridge = AttributeBridge::new();
        assert!(matches!(
            bridge.set(&mut params, "batch_subdivisions", json!(2)),
            Err(EngineError::ReadOnlyAttribute { .. })
        ));
        assert!(matches!(
            bridge.get(&params, "missing"),
            Err(EngineError::UnknownAttribute { .. })
        ));
    }
}
