//! Rerun visualization for simulated viewer runs.
//!
//! Visualization is optional and only available with the `visualization`
//! feature.
//!
//! # What Gets Logged
//!
//! - Visible entities as 2D points in screen space, colored by status
//! - Population counts per status as scalar timelines
//! - Lifecycle events (fallback, errors, scrubs) as text

use epiview_core::render::Color as PaintColor;
use epiview_core::StatusCounts;
use nalgebra::Vector2;
#[cfg(feature = "visualization")]
use epiview_core::Status;
#[cfg(feature = "visualization")]
use rerun::{Color, Points2D, Position2D, Radius, RecordingStream};

/// Rerun logger for simulation visualization.
pub struct RerunLogger {
    #[cfg(feature = "visualization")]
    rec: Option<RecordingStream>,

    /// Whether visualization is enabled
    enabled: bool,
}

impl RerunLogger {
    /// Creates a new logger with visualization disabled.
    pub fn disabled() -> Self {
        Self {
            #[cfg(feature = "visualization")]
            rec: None,
            enabled: false,
        }
    }

    /// Creates a new logger with visualization enabled.
    #[cfg(feature = "visualization")]
    pub fn new(name: &str) -> Self {
        match rerun::RecordingStreamBuilder::new(name).spawn() {
            Ok(rec) => {
                tracing::info!("Rerun visualization enabled - open Rerun Viewer to see the run");
                Self {
                    rec: Some(rec),
                    enabled: true,
                }
            }
            Err(e) => {
                tracing::warn!("Failed to initialize Rerun: {:?}", e);
                Self::disabled()
            }
        }
    }

    /// Creates a logger - returns disabled if visualization feature not enabled.
    #[cfg(not(feature = "visualization"))]
    pub fn new(_name: &str) -> Self {
        tracing::info!("Rerun visualization not available (compile with --features visualization)");
        Self::disabled()
    }

    /// Returns whether visualization is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Sets the frame number and virtual time for subsequent logs.
    #[cfg(feature = "visualization")]
    pub fn set_time(&self, frame: u64, seconds: f64) {
        if let Some(ref rec) = self.rec {
            rec.set_time_sequence("frame", frame as i64);
            rec.set_time_seconds("sim_time", seconds);
        }
    }

    #[cfg(not(feature = "visualization"))]
    pub fn set_time(&self, _frame: u64, _seconds: f64) {}

    /// Logs visible entities at their screen positions.
    #[cfg(feature = "visualization")]
    pub fn log_entities(&self, entities: &[(Vector2<f64>, PaintColor)]) {
        if let Some(ref rec) = self.rec {
            let points: Vec<Position2D> = entities
                .iter()
                .map(|(pos, _)| Position2D::new(pos.x as f32, pos.y as f32))
                .collect();
            let colors: Vec<Color> = entities
                .iter()
                .map(|(_, c)| Color::from_rgb(c.r, c.g, c.b))
                .collect();

            let _ = rec.log(
                "canvas/entities",
                &Points2D::new(points)
                    .with_colors(colors)
                    .with_radii([Radius::new_ui_points(3.0)]),
            );
        }
    }

    #[cfg(not(feature = "visualization"))]
    pub fn log_entities(&self, _entities: &[(Vector2<f64>, PaintColor)]) {}

    /// Logs the population split as one scalar per status.
    #[cfg(feature = "visualization")]
    pub fn log_counts(&self, counts: &StatusCounts) {
        if let Some(ref rec) = self.rec {
            for status in Status::all() {
                let _ = rec.log(
                    format!("metrics/counts/{}", status.name()),
                    &rerun::Scalar::new(counts.get(status) as f64),
                );
            }
        }
    }

    #[cfg(not(feature = "visualization"))]
    pub fn log_counts(&self, _counts: &StatusCounts) {}

    /// Logs a text annotation (e.g., fallback to batch).
    #[cfg(feature = "visualization")]
    pub fn log_event(&self, path: &str, message: &str) {
        if let Some(ref rec) = self.rec {
            let _ = rec.log(path, &rerun::TextLog::new(message));
        }
    }

    #[cfg(not(feature = "visualization"))]
    pub fn log_event(&self, _path: &str, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use epiview_core::{RenderStyle, Status};

    #[test]
    fn test_disabled_logger() {
        let logger = RerunLogger::disabled();
        assert!(!logger.is_enabled());

        // These should be no-ops
        logger.set_time(1, 0.016);
        logger.log_entities(&[(Vector2::new(1.0, 2.0), RenderStyle::default().color(Status::Infected))]);
        logger.log_counts(&StatusCounts::default());
    }
}
