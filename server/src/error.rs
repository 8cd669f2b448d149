//! Server error taxonomy.

use std::io;

use thiserror::Error;

/// Errors surfaced by the server core. Configuration, bind and spawn
/// failures are fatal at startup; everything else is handled per-connection
/// or per-worker.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected configuration; the server refuses to run.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that was requested.
        addr: String,
        /// The underlying bind or listen failure.
        source: io::Error,
    },

    /// A worker process or thread could not be started.
    #[error("failed to spawn worker {id}: {reason}")]
    Spawn {
        /// The worker id that was being started.
        id: u32,
        /// Human-readable cause.
        reason: String,
    },

    /// A control-channel operation between master and worker failed.
    #[error("control channel: {0}")]
    Channel(#[source] io::Error),

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
