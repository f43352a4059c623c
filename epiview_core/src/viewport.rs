//! Viewport transform: data space → base screen space → panned/zoomed screen.
//!
//! Two mappings are composed:
//!
//! ```text
//!   data (x, y) ──fit──▶ base screen ──(·scale + pan)──▶ screen
//! ```
//!
//! The fit is computed once from the entity bounding box and the canvas size
//! and only changes on resize or a new snapshot. The spatial index is built in
//! base-screen space, so a pan or zoom never rebuilds it; only the query
//! rectangle from [`ViewportTransform::screen_to_world_rect`] moves.

use crate::epiview_space::Rect;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How the data bounding box is fitted onto the padded canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMode {
    /// Each axis fills the padded canvas (corners land on padded corners)
    #[default]
    Fill,
    /// One scale for both axes, centered
    Uniform,
}

/// Viewport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    /// Canvas padding around the fitted data, in pixels (default: 50)
    pub padding: f64,
    pub fit_mode: FitMode,
    /// Zoom clamp (default: 0.5 - 10)
    pub min_scale: f64,
    pub max_scale: f64,
    /// Extra screen pixels queried around the canvas to avoid pop-in (default: 100)
    pub cull_margin: f64,
    /// Zoom used by `focus_on` (default: 2.0)
    pub focus_scale: f64,
    /// Step for the zoom buttons (default: 1.3)
    pub button_zoom_factor: f64,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            padding: 50.0,
            fit_mode: FitMode::Fill,
            min_scale: 0.5,
            max_scale: 10.0,
            cull_margin: 100.0,
            focus_scale: 2.0,
            button_zoom_factor: 1.3,
        }
    }
}

/// Fixed data → base-screen mapping: `base = data · scale + offset` per axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataFit {
    pub scale: Vector2<f64>,
    pub offset: Vector2<f64>,
}

impl DataFit {
    pub fn identity() -> Self {
        Self {
            scale: Vector2::new(1.0, 1.0),
            offset: Vector2::zeros(),
        }
    }

    /// Computes the mapping of `bounds` onto a canvas of `size` with padding.
    ///
    /// A degenerate axis (zero range) maps every value to the padded center of
    /// that axis instead of dividing by zero.
    pub fn compute(bounds: &Rect, size: Vector2<f64>, padding: f64, mode: FitMode) -> Self {
        let avail = Vector2::new(
            (size.x - 2.0 * padding).max(0.0),
            (size.y - 2.0 * padding).max(0.0),
        );
        let range = Vector2::new(bounds.width(), bounds.height());

        let axis_scale = |avail: f64, range: f64| {
            if range > 0.0 && range.is_finite() {
                Some(avail / range)
            } else {
                None
            }
        };
        let mut sx = axis_scale(avail.x, range.x);
        let mut sy = axis_scale(avail.y, range.y);

        if mode == FitMode::Uniform {
            let uniform = match (sx, sy) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            sx = sx.and(uniform);
            sy = sy.and(uniform);
        }

        // Center whatever extent the scaled data occupies inside the padded area.
        let place = |scale: Option<f64>, min: f64, range: f64, avail: f64| match scale {
            Some(s) => {
                let slack = avail - range * s;
                (s, padding + slack * 0.5 - min * s)
            }
            None => (0.0, padding + avail * 0.5),
        };
        let (scale_x, offset_x) = place(sx, bounds.min_x, range.x, avail.x);
        let (scale_y, offset_y) = place(sy, bounds.min_y, range.y, avail.y);

        Self {
            scale: Vector2::new(scale_x, scale_y),
            offset: Vector2::new(offset_x, offset_y),
        }
    }

    /// Maps a data-space point into base-screen space.
    pub fn apply(&self, x: f64, y: f64) -> Vector2<f64> {
        Vector2::new(
            x * self.scale.x + self.offset.x,
            y * self.scale.y + self.offset.y,
        )
    }
}

/// Data fit plus the user's pan/zoom.
#[derive(Debug, Clone)]
pub struct ViewportTransform {
    config: ViewportConfig,
    size: Vector2<f64>,
    data_bounds: Option<Rect>,
    fit: DataFit,
    pan: Vector2<f64>,
    scale: f64,
}

impl ViewportTransform {
    /// An empty, inverted or non-positive zoom range falls back to the default.
    pub fn new(size: Vector2<f64>, mut config: ViewportConfig) -> Self {
        if !(config.min_scale > 0.0 && config.min_scale <= config.max_scale) {
            let defaults = ViewportConfig::default();
            warn!(
                min = config.min_scale,
                max = config.max_scale,
                "unusable zoom range, using defaults"
            );
            config.min_scale = defaults.min_scale;
            config.max_scale = defaults.max_scale;
        }
        Self {
            config,
            size,
            data_bounds: None,
            fit: DataFit::identity(),
            pan: Vector2::zeros(),
            scale: 1.0,
        }
    }

    /// Fits the full point cloud into the canvas and resets pan/zoom.
    pub fn fit_to_data(&mut self, bounds: Rect, size: Vector2<f64>) {
        self.size = size;
        self.data_bounds = Some(bounds);
        self.fit = DataFit::compute(&bounds, size, self.config.padding, self.config.fit_mode);
        self.reset_view();
    }

    /// Canvas resize: refits the data mapping and keeps the user transform.
    ///
    /// Returns `true` when cached base-screen positions must be recomputed.
    pub fn resize(&mut self, size: Vector2<f64>) -> bool {
        if size == self.size {
            return false;
        }
        self.size = size;
        if let Some(bounds) = self.data_bounds {
            self.fit = DataFit::compute(&bounds, size, self.config.padding, self.config.fit_mode);
        }
        true
    }

    /// Back to the fitted view.
    pub fn reset_view(&mut self) {
        self.pan = Vector2::zeros();
        self.scale = 1.0;
    }

    /// Zooms by `factor` keeping the content under `anchor` stationary.
    pub fn zoom_at(&mut self, anchor: Vector2<f64>, factor: f64) {
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }
        let new_scale = (self.scale * factor).clamp(self.config.min_scale, self.config.max_scale);
        let ratio = new_scale / self.scale;
        self.pan = anchor - (anchor - self.pan) * ratio;
        self.scale = new_scale;
    }

    pub fn zoom_in(&mut self) {
        self.zoom_at(self.size * 0.5, self.config.button_zoom_factor);
    }

    pub fn zoom_out(&mut self) {
        self.zoom_at(self.size * 0.5, 1.0 / self.config.button_zoom_factor);
    }

    pub fn pan(&mut self, dx: f64, dy: f64) {
        self.pan += Vector2::new(dx, dy);
    }

    /// Centers the view on a base-screen point at the focus zoom level.
    pub fn focus_on(&mut self, base_pos: Vector2<f64>) {
        self.scale = self
            .config
            .focus_scale
            .clamp(self.config.min_scale, self.config.max_scale);
        self.pan = self.size * 0.5 - base_pos * self.scale;
    }

    /// Visible canvas mapped back into base-screen space, inflated by the cull margin.
    pub fn screen_to_world_rect(&self) -> Rect {
        let min = self.to_base(Vector2::zeros());
        let max = self.to_base(self.size);
        Rect::new(min.x, min.y, max.x, max.y).inflate(self.config.cull_margin / self.scale)
    }

    /// Data space → base-screen space.
    pub fn data_to_base(&self, x: f64, y: f64) -> Vector2<f64> {
        self.fit.apply(x, y)
    }

    /// Base-screen space → final screen pixels.
    pub fn to_screen(&self, base: Vector2<f64>) -> Vector2<f64> {
        base * self.scale + self.pan
    }

    /// Final screen pixels → base-screen space.
    pub fn to_base(&self, screen: Vector2<f64>) -> Vector2<f64> {
        (screen - self.pan) / self.scale
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn pan_offset(&self) -> Vector2<f64> {
        self.pan
    }

    pub fn size(&self) -> Vector2<f64> {
        self.size
    }

    pub fn data_fit(&self) -> &DataFit {
        &self.fit
    }

    /// Key identifying everything that affects the static base layer.
    pub fn view_key(&self) -> ViewKey {
        ViewKey {
            pan: (self.pan.x.to_bits(), self.pan.y.to_bits()),
            scale: self.scale.to_bits(),
            size: (self.size.x.to_bits(), self.size.y.to_bits()),
        }
    }
}

/// Bit-exact snapshot of the user transform and canvas size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pan: (u64, u64),
    scale: u64,
    size: (u64, u64),
}
