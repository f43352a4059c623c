//! Drawing surfaces.
//!
//! A [`Surface`] is the minimal 2D API the pipeline needs: circles, lines
//! and radial gradients. [`RasterSurface`] rasterizes into an
//! `image::RgbaImage`; [`RecordingSurface`] keeps a list of draw calls.

use image::{Rgba, RgbaImage};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// COLOR
// ============================================================================

/// Opaque RGB color. Opacity is passed per draw call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parses `#rrggbb` (the leading `#` is optional).
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#').unwrap_or(hex);
        if digits.len() != 6 || !digits.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).ok();
        Some(Self::rgb(channel(0)?, channel(2)?, channel(4)?))
    }

    pub fn to_rgba(self, alpha: f64) -> Rgba<u8> {
        Rgba([self.r, self.g, self.b, unit_to_byte(alpha)])
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl TryFrom<String> for Color {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Color::from_hex(&value).ok_or_else(|| format!("invalid color '{}'", value))
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_string()
    }
}

/// How a draw call combines with what is already on the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    SourceOver,
    Additive,
}

fn unit_to_byte(v: f64) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

// ============================================================================
// SURFACE TRAIT
// ============================================================================

/// A drawable layer.
pub trait Surface {
    /// Creates a transparent surface.
    fn with_size(width: u32, height: u32) -> Self
    where
        Self: Sized;

    fn size(&self) -> (u32, u32);

    /// Clears to fully transparent.
    fn clear(&mut self);

    fn fill_circle(&mut self, center: Vector2<f64>, radius: f64, color: Color, alpha: f64);

    fn stroke_circle(&mut self, center: Vector2<f64>, radius: f64, width: f64, color: Color, alpha: f64);

    fn line(&mut self, from: Vector2<f64>, to: Vector2<f64>, width: f64, color: Color, alpha: f64);

    /// Disc whose opacity falls linearly from `alpha` at the center to zero at `radius`.
    fn radial_gradient(
        &mut self,
        center: Vector2<f64>,
        radius: f64,
        color: Color,
        alpha: f64,
        blend: BlendMode,
    );
}

// ============================================================================
// RASTER SURFACE
// ============================================================================

/// Software rasterizer over an RGBA image with one pixel of antialiasing.
#[derive(Debug, Clone)]
pub struct RasterSurface {
    image: RgbaImage,
}

impl RasterSurface {
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Fills every pixel with an opaque color.
    pub fn fill(&mut self, color: Color) {
        let px = color.to_rgba(1.0);
        for pixel in self.image.pixels_mut() {
            *pixel = px;
        }
    }

    /// Draws another surface of the same size on top of this one.
    pub fn draw_over(&mut self, layer: &RasterSurface) {
        for (dst, src) in self.image.pixels_mut().zip(layer.image.pixels()) {
            if src[3] == 0 {
                continue;
            }
            let color = Color::rgb(src[0], src[1], src[2]);
            *dst = blend(*dst, color, f64::from(src[3]) / 255.0, BlendMode::SourceOver);
        }
    }

    /// Number of pixels with any opacity.
    pub fn painted_pixels(&self) -> usize {
        self.image.pixels().filter(|p| p[3] > 0).count()
    }

    /// Blends `color` into every pixel of the clipped box `min..=max`,
    /// weighted by the coverage at the pixel center.
    fn shade(
        &mut self,
        min: Vector2<f64>,
        max: Vector2<f64>,
        color: Color,
        alpha: f64,
        mode: BlendMode,
        coverage: impl Fn(Vector2<f64>) -> f64,
    ) {
        let (width, height) = self.image.dimensions();
        if width == 0 || height == 0 || alpha <= 0.0 {
            return;
        }
        if !(min.x.is_finite() && min.y.is_finite() && max.x.is_finite() && max.y.is_finite()) {
            return;
        }
        let x0 = min.x.floor().max(0.0);
        let y0 = min.y.floor().max(0.0);
        let x1 = max.x.ceil().min(f64::from(width - 1));
        let y1 = max.y.ceil().min(f64::from(height - 1));
        if x0 > x1 || y0 > y1 {
            return;
        }

        for y in y0 as u32..=y1 as u32 {
            for x in x0 as u32..=x1 as u32 {
                let center = Vector2::new(f64::from(x) + 0.5, f64::from(y) + 0.5);
                let c = coverage(center).clamp(0.0, 1.0);
                if c <= 0.0 {
                    continue;
                }
                let dst = *self.image.get_pixel(x, y);
                self.image.put_pixel(x, y, blend(dst, color, alpha * c, mode));
            }
        }
    }
}

fn blend(dst: Rgba<u8>, color: Color, alpha: f64, mode: BlendMode) -> Rgba<u8> {
    let a = alpha.clamp(0.0, 1.0);
    let src = [f64::from(color.r), f64::from(color.g), f64::from(color.b)];
    let dst_a = f64::from(dst[3]) / 255.0;
    match mode {
        BlendMode::SourceOver => {
            let out_a = a + dst_a * (1.0 - a);
            if out_a <= 0.0 {
                return Rgba([0, 0, 0, 0]);
            }
            let mix = |i: usize| {
                let v = (src[i] * a + f64::from(dst[i]) * dst_a * (1.0 - a)) / out_a;
                v.round().clamp(0.0, 255.0) as u8
            };
            Rgba([mix(0), mix(1), mix(2), unit_to_byte(out_a)])
        }
        BlendMode::Additive => {
            let add = |i: usize| (f64::from(dst[i]) + src[i] * a).round().min(255.0) as u8;
            Rgba([add(0), add(1), add(2), unit_to_byte(dst_a + a)])
        }
    }
}

impl Surface for RasterSurface {
    fn with_size(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }
    }

    fn fill_circle(&mut self, center: Vector2<f64>, radius: f64, color: Color, alpha: f64) {
        let reach = Vector2::repeat(radius + 1.0);
        self.shade(center - reach, center + reach, color, alpha, BlendMode::SourceOver, |p| {
            radius + 0.5 - (p - center).norm()
        });
    }

    fn stroke_circle(&mut self, center: Vector2<f64>, radius: f64, width: f64, color: Color, alpha: f64) {
        let half = width * 0.5;
        let reach = Vector2::repeat(radius + half + 1.0);
        self.shade(center - reach, center + reach, color, alpha, BlendMode::SourceOver, |p| {
            half + 0.5 - ((p - center).norm() - radius).abs()
        });
    }

    fn line(&mut self, from: Vector2<f64>, to: Vector2<f64>, width: f64, color: Color, alpha: f64) {
        let half = width * 0.5;
        let pad = Vector2::repeat(half + 1.0);
        let min = from.inf(&to) - pad;
        let max = from.sup(&to) + pad;
        let dir = to - from;
        let len_sq = dir.norm_squared();
        self.shade(min, max, color, alpha, BlendMode::SourceOver, |p| {
            let t = if len_sq > 0.0 {
                ((p - from).dot(&dir) / len_sq).clamp(0.0, 1.0)
            } else {
                0.0
            };
            half + 0.5 - (p - (from + dir * t)).norm()
        });
    }

    fn radial_gradient(
        &mut self,
        center: Vector2<f64>,
        radius: f64,
        color: Color,
        alpha: f64,
        blend: BlendMode,
    ) {
        if radius <= 0.0 {
            return;
        }
        let reach = Vector2::repeat(radius);
        self.shade(center - reach, center + reach, color, alpha, blend, |p| {
            1.0 - (p - center).norm() / radius
        });
    }
}

// ============================================================================
// RECORDING SURFACE
// ============================================================================

/// One recorded draw call.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCall {
    Clear,
    FillCircle {
        center: Vector2<f64>,
        radius: f64,
        color: Color,
        alpha: f64,
    },
    StrokeCircle {
        center: Vector2<f64>,
        radius: f64,
        color: Color,
        alpha: f64,
    },
    Line {
        from: Vector2<f64>,
        to: Vector2<f64>,
        color: Color,
        alpha: f64,
    },
    Gradient {
        center: Vector2<f64>,
        radius: f64,
        alpha: f64,
        blend: BlendMode,
    },
}

/// Surface that records calls since the last clear.
#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
    width: u32,
    height: u32,
    calls: Vec<DrawCall>,
    clears: usize,
}

impl RecordingSurface {
    pub fn calls(&self) -> &[DrawCall] {
        &self.calls
    }

    /// Total clears over the surface lifetime.
    pub fn clears(&self) -> usize {
        self.clears
    }

    pub fn count(&self, pred: impl Fn(&DrawCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }
}

impl Surface for RecordingSurface {
    fn with_size(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn clear(&mut self) {
        self.calls.clear();
        self.calls.push(DrawCall::Clear);
        self.clears += 1;
    }

    fn fill_circle(&mut self, center: Vector2<f64>, radius: f64, color: Color, alpha: f64) {
        self.calls.push(DrawCall::FillCircle {
            center,
            radius,
            color,
            alpha,
        });
    }

    fn stroke_circle(&mut self, center: Vector2<f64>, radius: f64, _width: f64, color: Color, alpha: f64) {
        self.calls.push(DrawCall::StrokeCircle {
            center,
            radius,
            color,
            alpha,
        });
    }

    fn line(&mut self, from: Vector2<f64>, to: Vector2<f64>, _width: f64, color: Color, alpha: f64) {
        self.calls.push(DrawCall::Line {
            from,
            to,
            color,
            alpha,
        });
    }

    fn radial_gradient(
        &mut self,
        center: Vector2<f64>,
        radius: f64,
        _color: Color,
        alpha: f64,
        blend: BlendMode,
    ) {
        self.calls.push(DrawCall::Gradient {
            center,
            radius,
            alpha,
            blend,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_hex() {
        let color = Color::from_hex("#10b981").unwrap();
        assert_eq!(color, Color::rgb(0x10, 0xb9, 0x81));
        assert_eq!(color.to_string(), "#10b981");
        assert!(Color::from_hex("#12345").is_none());
        assert!(Color::from_hex("zzzzzz").is_none());
    }

    #[test]
    fn test_color_serde() {
        let json = serde_json::to_string(&Color::rgb(255, 0, 16)).unwrap();
        assert_eq!(json, "\"#ff0010\"");
        let back: Color = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Color::rgb(255, 0, 16));
        assert!(serde_json::from_str::<Color>("\"red\"").is_err());
    }

    #[test]
    fn test_fill_circle_paints_center_only() {
        let mut surface = RasterSurface::with_size(20, 20);
        surface.fill_circle(Vector2::new(10.0, 10.0), 3.0, Color::rgb(255, 0, 0), 1.0);

        let center = surface.image().get_pixel(10, 10);
        assert_eq!(center.0, [255, 0, 0, 255]);
        assert_eq!(surface.image().get_pixel(0, 0)[3], 0);
        assert!(surface.painted_pixels() < 60);
    }

    #[test]
    fn test_offscreen_draws_are_clipped() {
        let mut surface = RasterSurface::with_size(10, 10);
        surface.fill_circle(Vector2::new(-500.0, -500.0), 4.0, Color::rgb(1, 2, 3), 1.0);
        surface.line(
            Vector2::new(-1e9, 5.0),
            Vector2::new(-1e8, 5.0),
            1.0,
            Color::rgb(1, 2, 3),
            1.0,
        );
        assert_eq!(surface.painted_pixels(), 0);
    }

    #[test]
    fn test_additive_gradient_accumulates() {
        let mut surface = RasterSurface::with_size(10, 10);
        let color = Color::rgb(100, 0, 0);
        surface.radial_gradient(Vector2::new(5.0, 5.0), 4.0, color, 1.0, BlendMode::Additive);
        let once = surface.image().get_pixel(5, 5)[0];
        surface.radial_gradient(Vector2::new(5.0, 5.0), 4.0, color, 1.0, BlendMode::Additive);
        let twice = surface.image().get_pixel(5, 5)[0];
        assert!(twice > once);
    }

    #[test]
    fn test_draw_over_keeps_background_where_transparent() {
        let mut background = RasterSurface::with_size(8, 8);
        background.fill(Color::rgb(15, 23, 42));
        let mut layer = RasterSurface::with_size(8, 8);
        layer.fill_circle(Vector2::new(4.5, 4.5), 1.0, Color::rgb(255, 255, 255), 1.0);

        background.draw_over(&layer);
        assert_eq!(background.image().get_pixel(0, 0).0, [15, 23, 42, 255]);
        assert_eq!(background.image().get_pixel(4, 4).0, [255, 255, 255, 255]);
    }

    #[test]
    fn test_recording_surface() {
        let mut surface = RecordingSurface::with_size(4, 4);
        surface.clear();
        surface.fill_circle(Vector2::zeros(), 1.0, Color::rgb(0, 0, 0), 1.0);
        surface.line(Vector2::zeros(), Vector2::new(1.0, 1.0), 1.0, Color::rgb(0, 0, 0), 0.5);
        assert_eq!(surface.calls().len(), 3);
        assert_eq!(surface.count(|c| matches!(c, DrawCall::Line { .. })), 1);

        surface.clear();
        assert_eq!(surface.calls(), &[DrawCall::Clear]);
        assert_eq!(surface.clears(), 2);
    }
}
