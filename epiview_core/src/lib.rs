//! EpiView Core - Live Visualization Engine for Epidemic Contact Networks
//!
//! This library keeps a large contact network on screen while a remote
//! simulation streams per-step status changes at it:
//! 1. **Where**: data-space layout fitted to the canvas, plus a quadtree for
//!    viewport culling (`viewport`, `epiview_space`, `scene`)
//! 2. **What**: an append-only step log folded into per-entity status, with
//!    replay, scrubbing and snapshots (`event`, `epiview_world`, `playback`)
//! 3. **How it looks**: layered raster drawing that only repaints what changed
//!    (`render`)
//!
//! ```text
//!  StreamTransport ─▶ ingest ─▶ playback ─┬─▶ WorldState ─▶ render ─▶ layers
//!  BatchFetcher ────┘          │          └─▶ stats (throttled history)
//!                              ▼
//!                         EventLog + snapshots
//! ```

pub mod config;
pub mod epiview_space;
pub mod epiview_world;
pub mod error;
pub mod event;
pub mod graph;
pub mod ingest;
pub mod playback;
pub mod render;
pub mod scene;
pub mod session;
pub mod stats;
pub mod viewport;

// Re-export key types for convenience
pub use config::ViewerConfig;
pub use epiview_space::{IndexConfig, QuadTree, Rect};
pub use epiview_world::{Status, StatusCounts, WorldState};
pub use error::CoreError;
pub use event::{StepEvent, StreamMessage};
pub use graph::{EntityId, GraphSnapshot, Network, ZoneId};
pub use ingest::{IngestMode, IngestionAdapter};
pub use playback::{HistoryObserver, PlaybackConfig, PlaybackController, PlaybackState};
pub use render::{Color, RasterSurface, RecordingSurface, RenderPipeline, RenderStyle, Surface};
pub use scene::Scene;
pub use session::{SessionReport, ViewerSession};
pub use stats::{StatisticsTracker, Summary};
pub use viewport::{ViewportConfig, ViewportTransform};
