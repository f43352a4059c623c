//! Viewer configuration.
//!
//! Every section defaults independently, so a config file only needs the
//! keys it changes:
//!
//! ```json
//! { "canvas_width": 1280, "playback": { "snapshot_interval": 128 } }
//! ```

use crate::epiview_space::IndexConfig;
use crate::error::CoreError;
use crate::playback::PlaybackConfig;
use crate::render::RenderStyle;
use crate::viewport::ViewportConfig;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Complete viewer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Canvas width in pixels (default: 800)
    pub canvas_width: u32,
    /// Canvas height in pixels (default: 600)
    pub canvas_height: u32,
    pub viewport: ViewportConfig,
    pub index: IndexConfig,
    pub playback: PlaybackConfig,
    pub render: RenderStyle,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            canvas_width: 800,
            canvas_height: 600,
            viewport: ViewportConfig::default(),
            index: IndexConfig::default(),
            playback: PlaybackConfig::default(),
            render: RenderStyle::default(),
        }
    }
}

impl ViewerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_json_str(&text)?;
        info!(path = %path.display(), "loaded viewer config");
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn canvas_size(&self) -> Vector2<f64> {
        Vector2::new(f64::from(self.canvas_width), f64::from(self.canvas_height))
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> Result<(), CoreError> {
        let v = &self.viewport;
        if !(v.min_scale > 0.0 && v.min_scale <= v.max_scale) {
            return Err(CoreError::Config(format!(
                "zoom range {}..{} is empty or non-positive",
                v.min_scale, v.max_scale
            )));
        }
        let p = &self.playback;
        if !(p.min_speed > 0.0 && p.min_speed <= p.max_speed) {
            return Err(CoreError::Config(format!(
                "speed range {}..{} is empty or non-positive",
                p.min_speed, p.max_speed
            )));
        }
        if p.base_step_interval_ms == 0 {
            return Err(CoreError::Config("base_step_interval_ms must be positive".into()));
        }
        if self.render.heat_saturation <= 0.0 {
            return Err(CoreError::Config("heat_saturation must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewport::FitMode;

    #[test]
    fn test_defaults() {
        let config = ViewerConfig::default();
        assert_eq!(config.index.capacity, 4);
        assert_eq!(config.viewport.padding, 50.0);
        assert_eq!(config.playback.snapshot_interval, 64);
        assert_eq!(config.render.heat_threshold, 0.1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = ViewerConfig::from_json_str(
            r##"{"canvas_width": 1280,
                 "viewport": {"fit_mode": "uniform"},
                 "render": {"infected": "#ff0000", "heatmap": false}}"##,
        )
        .unwrap();
        assert_eq!(config.canvas_width, 1280);
        assert_eq!(config.canvas_height, 600);
        assert_eq!(config.viewport.fit_mode, FitMode::Uniform);
        assert_eq!(config.viewport.padding, 50.0);
        assert!(!config.render.heatmap);
        assert_eq!(config.render.infected.to_string(), "#ff0000");
    }

    #[test]
    fn test_json_round_trip() {
        let config = ViewerConfig::default();
        let json = config.to_json_string().unwrap();
        let back = ViewerConfig::from_json_str(&json).unwrap();
        assert_eq!(back.canvas_size(), config.canvas_size());
        assert_eq!(back.render.background, config.render.background);
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        let result = ViewerConfig::from_json_str(r#"{"playback": {"min_speed": 0}}"#);
        assert!(matches!(result, Err(CoreError::Config(_))));
        let result = ViewerConfig::from_json_str(r#"{"viewport": {"min_scale": 20}}"#);
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = ViewerConfig::from_json_file("/nonexistent/epiview.json");
        assert!(matches!(result, Err(CoreError::Config(_))));
    }
}
