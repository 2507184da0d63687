//! Application-wide error types.

use thiserror::Error;

use crate::pipeline::stage::StageId;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// Pipeline errors are tagged variants, not strings: the orchestrator and the
/// enqueue adapter match on them to decide run state and API responses.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Coordination store error: {0}")]
    Coord(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Conflict: subject {0} already has an active run")]
    Conflict(String),

    #[error("Lock lost for subject {0}: fencing token no longer matches")]
    LockLost(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Model not registered: {0}")]
    ModelNotRegistered(String),

    #[error("Tunnel to {model_key} not ready after {waited_secs}s")]
    TunnelReadinessTimeout { model_key: String, waited_secs: u64 },

    #[error("Local port {0} is in use and could not be reclaimed")]
    LocalPortInUse(u16),

    #[error("Failed to parse inference output: {0}")]
    InferenceParse(String),

    #[error("Recoverable {stage} failure for {item}: {message}")]
    Recoverable {
        stage: StageId,
        item: String,
        message: String,
    },

    #[error("Object store error: {0}")]
    Storage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn recoverable(stage: StageId, item: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Recoverable {
            stage,
            item: item.into(),
            message: message.into(),
        }
    }

    /// Whether this error ends the whole run when raised from a stage body.
    ///
    /// `Recoverable` failures are counted and the stage continues; everything
    /// else breaks the stage loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable { .. })
    }
}
