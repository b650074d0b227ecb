//! Error types for the training engine.
//!
//! Uses `thiserror` for structured variants covering configuration,
//! attribute resolution, state restoration and persistence.

/// Top-level error type for the trainloop core library.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("batch_size ({batch_size}) should be a multiple of mini_batch_size ({mini_batch_size})")]
    InvalidBatchSize {
        batch_size: usize,
        mini_batch_size: usize,
    },

    #[error("{name} attribute does not exist")]
    UnknownAttribute { name: String },

    #[error("{name} attribute is read-only")]
    ReadOnlyAttribute { name: String },

    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("No {what} available")]
    MissingComponent { what: &'static str },

    #[error("State mismatch: missing keys {missing:?}, unexpected keys {unexpected:?}")]
    StateMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("Persisted record is missing the '{key}' entry")]
    MissingRecordKey { key: String },

    #[error("No dataloader available; pass one to the trainer or return one from Engine::start")]
    NoDataLoader,

    #[error("Hook failed: {message}")]
    Hook { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn hook(msg: impl Into<String>) -> Self {
        Self::Hook {
            message: msg.into(),
        }
    }

    pub fn invalid_value(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_attribute(name: impl Into<String>) -> Self {
        Self::UnknownAttribute { name: name.into() }
    }
}

/// Convenience alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;
