//! EpiView Deterministic Simulation Harness
//!
//! This crate runs the whole viewer against a simulated outside world where
//! every source of non-determinism is controlled:
//! - **Time**: a virtual clock that moves one animation frame per tick
//! - **Service**: a seeded outbreak oracle producing the graph and the stream
//! - **Transport**: scripted delivery with injected refusals, drops and
//!   corrupt frames
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ScenarioRunner                         │
//! │  ┌────────────┐  script   ┌───────────┐  frames  ┌─────────┐ │
//! │  │   Oracle   │──────────▶│ SimStream │─────────▶│ Viewer  │ │
//! │  │ (outbreak) │           │ (faults)  │          │ Session │ │
//! │  └─────┬──────┘           └───────────┘          └────┬────┘ │
//! │        │ truth per step        SimFetcher ───────────▶│      │
//! │        └──────────────▶ checks ◀──────────────────────┘      │
//! │                    (fold == replay, counts == truth)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use epiview_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 500).run(ScenarioId::ScrubStorm);
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod exporter;
mod network;
mod oracle;
mod runner;
pub mod scenarios;
mod visualizer;

pub use context::SimContext;
pub use error::SimError;
pub use exporter::{write_png, SimExport, SimFrame};
pub use network::{SimFetcher, SimStream, StreamFaults, StreamItem, StreamTiming};
pub use oracle::{GroundTruthEntity, Oracle, OutbreakConfig};
pub use runner::{RecordedRun, ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use visualizer::RerunLogger;
