//! Error types for the tether runtime.

use std::path::PathBuf;

/// Top-level error type for the bot runtime.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Durable state could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Inbound trigger listener error (bind, serve).
    #[error("ingest error: {0}")]
    Ingest(String),

    /// Scheduler error (task spawn, join).
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

/// Failure reading or writing the runtime state snapshot.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The state file exists but could not be read.
    #[error("failed to read state file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The state file could not be written or replaced.
    #[error("failed to write state file '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The snapshot could not be serialized.
    #[error("failed to encode state snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    /// The state file is not a valid snapshot document.
    #[error("failed to decode state file '{}': {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The backing store is not reachable.
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BotError>;
