//! Transport abstractions for the external simulation service.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{Frame, RunRequest};

/// Server-push channel carrying one simulation run.
///
/// # Implementations
///
/// - **Production**: `ChannelTransport` fed by whatever socket task owns the
///   connection
/// - **Simulation**: scripted stream with fault injection
///
/// # Frame Flow
///
/// ```text
/// Service                    Transport                    Viewer
///   |                           |                            |
///   |<-- open(run_request) -----|                            |
///   |-- frame ----------------->|                            |
///   |                           |-- recv() -> Some(Ok(frame))|
///   |-- {"done":true} --------->|                            |
///   |                           |-- recv() -> None           |
/// ```
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Establishes the push channel for a run.
    ///
    /// # Returns
    /// * `Ok(())` - channel ready, frames will follow
    /// * `Err(EnvError::TransportError)` - push unavailable; callers fall back
    ///   to `BatchFetcher::fetch_batch`
    async fn open(&self, request: &RunRequest) -> Result<(), EnvError>;

    /// Receives the next frame.
    ///
    /// # Returns
    /// * `Some(Ok(frame))` - a frame arrived
    /// * `Some(Err(_))` - the channel failed
    /// * `None` - the channel was closed
    async fn recv(&self) -> Option<Result<Frame, EnvError>>;

    /// Closes the channel; later `recv` calls return `None`.
    fn close(&self);
}

/// Request/response side of the external service.
#[async_trait]
pub trait BatchFetcher: Send + Sync + 'static {
    /// Fetches the graph snapshot (entities and contact edges) as raw JSON.
    async fn fetch_graph(&self) -> Result<Vec<u8>, EnvError>;

    /// Runs the simulation in one request and returns the JSON array of all
    /// stream messages.
    async fn fetch_batch(&self, request: &RunRequest) -> Result<Vec<u8>, EnvError>;
}
