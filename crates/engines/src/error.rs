//! Engine error taxonomy.

use thiserror::Error;

/// Initialization failures.
///
/// Cloneable: concurrent `initialize` calls share one in-flight operation,
/// and every waiter receives the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InitError {
    /// The user cancelled the download/initialization. Informational, not a
    /// fault: callers surface it without an error affordance.
    #[error("download cancelled")]
    Cancelled,

    /// The model artifact could not be fetched or stored.
    #[error("model download failed: {0}")]
    Download(String),

    /// The artifact was present but the runtime could not load it.
    #[error("failed to load model: {0}")]
    Load(String),

    /// The CPU inference worker died or reported a fault during init.
    #[error("inference worker failed: {0}")]
    Worker(String),
}

/// Generation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerateError {
    /// Generation was requested before the engine finished initializing.
    #[error("engine not initialized")]
    NotReady,

    /// The user stopped an in-flight generation. Tokens already streamed
    /// remain valid and are not retracted.
    #[error("generation aborted")]
    Aborted,

    /// The CPU inference worker died or reported a fault mid-generation.
    #[error("inference worker failed: {0}")]
    Worker(String),

    /// The model runtime failed while producing tokens.
    #[error("generation failed: {0}")]
    Runtime(String),
}
