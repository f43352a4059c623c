//! Core environment context trait for the EpiView viewer loop.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for time and scheduling.
///
/// The viewer is a single cooperative loop: network receive and the
/// animation-frame timer are its only suspension points. Everything the loop
/// needs from the host scheduler goes through this trait so the same loop
/// runs on tokio in production and on a virtual clock in simulation.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` (in `epiview_sim`) - manually advanced clock
#[async_trait]
pub trait EpiViewContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    ///
    /// Used for throttling history publication and playback pacing.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
