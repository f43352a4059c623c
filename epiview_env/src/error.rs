//! Error types for the EpiView environment abstraction.

use thiserror::Error;

/// Errors that can occur at the environment boundary.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The push channel could not be established or broke mid-run
    #[error("Transport error: {0}")]
    TransportError(String),

    /// A request/response fetch (graph snapshot, batch run) failed
    #[error("Fetch error: {0}")]
    FetchError(String),

    /// The stream was used before `open` or after `close`
    #[error("Stream closed")]
    Closed,

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportError(msg.into())
    }

    /// Creates a fetch error.
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::FetchError(msg.into())
    }
}
