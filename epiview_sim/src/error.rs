//! Error types for the simulation harness.

use epiview_core::CoreError;
use epiview_env::EnvError;
use thiserror::Error;

/// Errors raised while setting up or exporting a simulated run.
#[derive(Debug, Error)]
pub enum SimError {
    /// Oracle parameters that cannot produce an outbreak
    #[error("Invalid outbreak config: {0}")]
    InvalidConfig(String),

    /// The async runtime driving the session could not start
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl SimError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
