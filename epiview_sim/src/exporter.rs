//! JSON and PNG export of simulated viewer runs.
//!
//! Sampled frames go to JSON for offline plotting; the final composited
//! canvas goes to PNG.

use crate::error::SimError;
use epiview_core::render::FrameStats;
use epiview_core::{PlaybackState, StatusCounts, Summary};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// One sampled frame of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Virtual time in seconds
    pub time_sec: f64,

    pub state: PlaybackState,

    /// Last folded step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<usize>,

    /// Last logged step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<usize>,

    pub counts: StatusCounts,

    /// Present when the frame was drawn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render: Option<FrameStats>,
}

/// Complete run export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    pub scenario: String,
    pub seed: u64,
    pub entities: usize,

    /// Virtual time of the last frame
    pub duration_sec: f64,

    pub frames: Vec<SimFrame>,

    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64, entities: usize) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            entities,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
            summary: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Records the outcome.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>, summary: Summary) {
        self.passed = passed;
        self.failure_reason = failure_reason;
        self.summary = Some(summary);
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path.as_ref())?;
        file.write_all(json.as_bytes())?;
        info!(path = %path.as_ref().display(), frames = self.frames.len(), "export written");
        Ok(())
    }
}

/// Saves a composited canvas as PNG.
pub fn write_png(image: &RgbaImage, path: impl AsRef<Path>) -> Result<(), SimError> {
    image.save_with_format(path.as_ref(), image::ImageFormat::Png)?;
    info!(
        path = %path.as_ref().display(),
        width = image.width(),
        height = image.height(),
        "frame written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir().join(format!("epiview_{}_{}", nanos, name))
    }

    #[test]
    fn test_export_tracks_duration_and_serializes() {
        let mut export = SimExport::new("live_stream", 42, 10);
        for k in 0..3 {
            export.add_frame(SimFrame {
                time_sec: k as f64 * 0.5,
                state: PlaybackState::Streaming,
                cursor: Some(k),
                head: Some(k),
                counts: StatusCounts::default(),
                render: None,
            });
        }
        export.finalize(true, None, Summary::default());
        assert_eq!(export.duration_sec, 1.0);

        let path = temp_path("export.json");
        export.write_to_file(&path).unwrap();
        let read: SimExport = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(read.frames.len(), 3);
        assert!(read.passed);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_png_written() {
        let image = RgbaImage::from_pixel(4, 3, image::Rgba([15, 23, 42, 255]));
        let path = temp_path("frame.png");
        write_png(&image, &path).unwrap();
        let back = image::open(&path).unwrap().to_rgba8();
        assert_eq!((back.width(), back.height()), (4, 3));
        let _ = std::fs::remove_file(path);
    }
}
