//! Error types for the EpiView core.

use epiview_env::EnvError;
use thiserror::Error;

/// Errors raised by the viewer core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A stream frame was not valid JSON or not a known message shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// A step-event decoded but violates the stream contract
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// WorldState was asked to apply an event out of order
    #[error("Out-of-order apply: expected step {expected}, got {got}")]
    OutOfOrder { expected: usize, got: usize },

    /// A playback operation is not valid in the current state
    #[error("Cannot {op} while {state}")]
    InvalidState { op: &'static str, state: &'static str },

    /// The simulation service reported a failure on the stream
    #[error("Simulation error: {0}")]
    Remote(String),

    /// The graph snapshot could not be used
    #[error("Graph error: {0}")]
    Graph(String),

    /// Configuration file could not be read
    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Env(#[from] EnvError),
}

impl CoreError {
    /// Creates a malformed-event error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEvent(msg.into())
    }
}
