//! EpiView Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" boundary between the EpiView viewer core
//! and the outside world, so the same engine runs against a **Production**
//! (tokio) environment and a **Simulation** (virtual clock) environment.
//!
//! # What gets intercepted
//!
//! - Time (`now()`, `sleep()`) - drives animation frames and playback ticks
//! - Server push (`StreamTransport`) - the live step-event stream
//! - Request/response (`BatchFetcher`) - graph snapshot and batch fallback
//!
//! # Example
//!
//! ```ignore
//! use epiview_env::{EpiViewContext, StreamTransport};
//!
//! async fn viewer_loop<Ctx: EpiViewContext, T: StreamTransport>(ctx: &Ctx, stream: &T) {
//!     loop {
//!         tokio::select! {
//!             frame = stream.recv() => handle_frame(frame),
//!             _ = ctx.sleep(Duration::from_millis(16)) => animation_frame(),
//!         }
//!     }
//! }
//! ```

mod context;
mod error;
mod tokio_impl;
mod transport;
mod types;

pub use context::EpiViewContext;
pub use error::EnvError;
pub use tokio_impl::{ChannelTransport, StreamFeed, TokioContext};
pub use transport::{BatchFetcher, StreamTransport};
pub use types::{Frame, RunId, RunRequest};
