use std::path::PathBuf;

use thiserror::Error;

/// Failures of the durable backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The store file could not be created, opened or parsed
    #[error("store file {path:?} is unavailable: {reason}")]
    Unavailable { path: PathBuf, reason: String },
    #[error("failed to persist store file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The window runs without a backend after it failed to open
    #[error("no backend attached, running in memory only")]
    Detached,
    #[error("backend task failed: {0}")]
    Task(String),
}

/// Errors building a schema. These are defects and should stop startup.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("key {key:?} is declared more than once")]
    DuplicateKey { key: String },
    #[error("default value of key {key:?} is invalid: {reason}")]
    InvalidDefault { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is not initialized yet; await init() or check is_ready()")]
    NotReady,
    #[error("key {key:?} is not declared in the schema")]
    UnknownKey { key: String },
    #[error("key {key:?} holds {declared}, not {requested}")]
    TypeMismatch {
        key: String,
        declared: &'static str,
        requested: &'static str,
    },
    #[error("invalid value for key {key:?}: {reason}")]
    InvalidValue { key: String, reason: String },
    /// The value is applied locally but did not reach durable storage
    #[error("value for key {key:?} was not persisted: {source}")]
    Persistence {
        key: String,
        #[source]
        source: BackendError,
    },
    #[error("failed to encode or decode key {key:?}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store has been dropped")]
    Closed,
    /// An earlier `Window::init` ran the setup hooks and one of them failed
    #[error("window setup failed: {reason}")]
    Setup { reason: String },
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,
    #[error("failed to encode bus payload: {0}")]
    Encode(#[from] serde_json::Error),
}
