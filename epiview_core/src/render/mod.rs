//! RenderPipeline - layered, viewport-culled drawing of the scene.
//!
//! Three layers, each with its own invalidation rule:
//!
//! ```text
//!   ┌────────────┐  redrawn every tick         transmission edges, status
//!   │   active   │                             colors, infection halos
//!   ├────────────┤  redrawn when the applied   additive zone-load glow
//!   │    heat    │  step or the view changes
//!   ├────────────┤  redrawn when the view      contact edges and every
//!   │    base    │  key changes                visible entity (susceptible)
//!   ├────────────┤
//!   │ background │  solid fill at composite time
//!   └────────────┘
//! ```
//!
//! All three read the same visible set, one quadtree query per tick.
//! Animation phase comes from a frame counter that only advances while the
//! loop is active.

pub mod surface;

pub use surface::{BlendMode, Color, DrawCall, RasterSurface, RecordingSurface, Surface};

use crate::epiview_world::{Status, WorldState};
use crate::graph::EntityId;
use crate::scene::{BaseKey, Scene};
use image::RgbaImage;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{debug, info};

// ============================================================================
// STYLE
// ============================================================================

/// Colors, sizes and heatmap tuning.
///
/// Radii are in base-screen units and grow with zoom; line widths are in
/// screen pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderStyle {
    pub background: Color,
    pub susceptible: Color,
    pub exposed: Color,
    pub infected: Color,
    pub recovered: Color,
    pub dead: Color,
    pub edge: Color,
    pub active_edge: Color,
    pub infected_outline: Color,

    /// Entity radius (default: 7)
    pub node_radius: f64,
    /// Infected entity radius (default: 10)
    pub infected_radius: f64,

    pub edge_width: f64,
    pub active_edge_width: f64,
    pub outline_width: f64,

    /// Animation phase per frame (default: 0.05)
    pub pulse_rate: f64,

    /// Draw the zone-load heatmap layer
    pub heatmap: bool,
    /// Loads at or below this are not drawn (default: 0.1)
    pub heat_threshold: f64,
    /// Load at which the glow saturates (default: 10)
    pub heat_saturation: f64,
    pub heat_radius: f64,
    pub heat_alpha: f64,
    pub heat_color: Color,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            background: Color::rgb(0x0f, 0x17, 0x2a),
            susceptible: Color::rgb(0x10, 0xb9, 0x81),
            exposed: Color::rgb(0xf5, 0x9e, 0x0b),
            infected: Color::rgb(0xef, 0x44, 0x44),
            recovered: Color::rgb(0x3b, 0x82, 0xf6),
            dead: Color::rgb(0x6b, 0x72, 0x80),
            edge: Color::rgb(0x4b, 0x55, 0x63),
            active_edge: Color::rgb(0xef, 0x44, 0x44),
            infected_outline: Color::rgb(0xff, 0xff, 0xff),
            node_radius: 7.0,
            infected_radius: 10.0,
            edge_width: 0.4,
            active_edge_width: 1.5,
            outline_width: 1.5,
            pulse_rate: 0.05,
            heatmap: true,
            heat_threshold: 0.1,
            heat_saturation: 10.0,
            heat_radius: 120.0,
            heat_alpha: 0.6,
            heat_color: Color::rgb(0xf9, 0x73, 0x16),
        }
    }
}

impl RenderStyle {
    pub fn color(&self, status: Status) -> Color {
        match status {
            Status::Susceptible => self.susceptible,
            Status::Exposed => self.exposed,
            Status::Infected => self.infected,
            Status::Recovered => self.recovered,
            Status::Dead => self.dead,
        }
    }

    pub fn radius(&self, status: Status) -> f64 {
        if status == Status::Infected {
            self.infected_radius
        } else {
            self.node_radius
        }
    }
}

/// Opacity of transmission-active edges at animation phase `phase`.
pub fn active_edge_alpha(phase: f64) -> f64 {
    0.4 + phase.sin() * 0.2
}

/// The two halo rings around an infected entity as `(radius, alpha)`.
pub fn halo_rings(size: f64, phase: f64) -> [(f64, f64); 2] {
    let outer = size + (phase.sin() + 1.0) * 4.0;
    let inner = size + ((phase + PI).sin() + 1.0) * 3.0;
    [
        (outer, (0.5 - (outer - size) / 12.0).max(0.0)),
        (inner, (0.3 - (inner - size) / 12.0).max(0.0)),
    ]
}

// ============================================================================
// PIPELINE
// ============================================================================

/// What one tick drew.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStats {
    pub frame: u64,
    pub visible: usize,
    /// Edges on the base layer as of its last redraw
    pub edges_drawn: usize,
    pub active_edges: usize,
    pub active_entities: usize,
    pub halos: usize,
    pub heat_zones: usize,
    pub base_redrawn: bool,
    pub heat_redrawn: bool,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderStats {
    pub frames: u64,
    pub base_redraws: u64,
    pub heat_redraws: u64,
}

/// Layered renderer over any [`Surface`].
pub struct RenderPipeline<S: Surface> {
    style: RenderStyle,
    base: S,
    heat: S,
    active: S,
    frame: u64,
    running: bool,
    base_key: Option<BaseKey>,
    /// View, world generation and last applied step of the heat layer
    heat_key: Option<(BaseKey, u64, Option<usize>)>,
    base_edges: usize,
    heat_zones: usize,
    visible: Vec<usize>,
    visible_mask: Vec<bool>,
    stats: RenderStats,
}

impl<S: Surface> RenderPipeline<S> {
    pub fn new(style: RenderStyle, width: u32, height: u32) -> Self {
        Self {
            style,
            base: S::with_size(width, height),
            heat: S::with_size(width, height),
            active: S::with_size(width, height),
            frame: 0,
            running: true,
            base_key: None,
            heat_key: None,
            base_edges: 0,
            heat_zones: 0,
            visible: Vec::new(),
            visible_mask: Vec::new(),
            stats: RenderStats::default(),
        }
    }

    /// Starts or stops ticking. Stopped ticks draw nothing and do not
    /// advance the frame counter.
    pub fn set_active(&mut self, active: bool) {
        if self.running != active {
            info!(active, frame = self.frame, "render loop toggled");
        }
        self.running = active;
    }

    pub fn is_active(&self) -> bool {
        self.running
    }

    /// One animation tick. Returns `None` while inactive.
    pub fn draw(&mut self, scene: &Scene, world: &WorldState) -> Option<FrameStats> {
        if !self.running {
            return None;
        }

        self.sync_surface_size(scene);
        scene.visible_into(&mut self.visible);
        self.visible_mask.clear();
        self.visible_mask.resize(scene.network().len(), false);
        for &idx in &self.visible {
            self.visible_mask[idx] = true;
        }

        let key = scene.base_key();
        let base_redrawn = self.base_key != Some(key);
        if base_redrawn {
            self.draw_base(scene);
            self.base_key = Some(key);
            self.stats.base_redraws += 1;
        }

        let heat_key = (key, world.generation(), world.last_applied());
        let heat_redrawn = self.style.heatmap && self.heat_key != Some(heat_key);
        if heat_redrawn {
            self.draw_heat(scene, world);
            self.heat_key = Some(heat_key);
            self.stats.heat_redraws += 1;
        }

        let phase = self.frame as f64 * self.style.pulse_rate;
        let mut stats = self.draw_active(scene, world, phase);
        stats.frame = self.frame;
        stats.visible = self.visible.len();
        stats.edges_drawn = self.base_edges;
        stats.heat_zones = self.heat_zones;
        stats.base_redrawn = base_redrawn;
        stats.heat_redrawn = heat_redrawn;

        self.frame += 1;
        self.stats.frames += 1;
        debug!(
            frame = stats.frame,
            visible = stats.visible,
            active_edges = stats.active_edges,
            base_redrawn,
            "frame drawn"
        );
        Some(stats)
    }

    fn sync_surface_size(&mut self, scene: &Scene) {
        let size = scene.viewport().size();
        let dims = (size.x.round().max(0.0) as u32, size.y.round().max(0.0) as u32);
        if self.base.size() != dims {
            self.base = S::with_size(dims.0, dims.1);
            self.heat = S::with_size(dims.0, dims.1);
            self.active = S::with_size(dims.0, dims.1);
            self.base_key = None;
            self.heat_key = None;
            self.heat_zones = 0;
        }
    }

    fn draw_base(&mut self, scene: &Scene) {
        let network = scene.network();
        let style = &self.style;
        self.base.clear();

        let mut edges = 0;
        for &(a, b) in network.edges() {
            if !(self.visible_mask[a] || self.visible_mask[b]) {
                continue;
            }
            if let (Some(pa), Some(pb)) = (scene.screen_position(a), scene.screen_position(b)) {
                self.base.line(pa, pb, style.edge_width, style.edge, 1.0);
                edges += 1;
            }
        }

        let radius = style.node_radius * scene.viewport().scale();
        for &idx in &self.visible {
            if let Some(pos) = scene.screen_position(idx) {
                self.base.fill_circle(pos, radius, style.susceptible, 1.0);
            }
        }
        self.base_edges = edges;
    }

    fn draw_heat(&mut self, scene: &Scene, world: &WorldState) {
        let style = &self.style;
        let viewport = scene.viewport();
        self.heat.clear();

        let mut zones = 0;
        for (&zone, &load) in world.zone_loads() {
            if load <= style.heat_threshold {
                continue;
            }
            let Some(centroid) = scene.zone_centroid(zone) else {
                continue;
            };
            let level = (load / style.heat_saturation).min(1.0);
            self.heat.radial_gradient(
                viewport.to_screen(centroid),
                style.heat_radius * level * viewport.scale(),
                style.heat_color,
                style.heat_alpha * level,
                BlendMode::Additive,
            );
            zones += 1;
        }
        self.heat_zones = zones;
    }

    fn draw_active(&mut self, scene: &Scene, world: &WorldState, phase: f64) -> FrameStats {
        let network = scene.network();
        let style = &self.style;
        let scale = scene.viewport().scale();
        let status_of = |idx: usize| {
            network
                .entity(idx)
                .and_then(|e| world.status(e.id))
                .unwrap_or_default()
        };
        let mut stats = FrameStats::default();
        self.active.clear();

        // Infected-susceptible pairs. Each pair is reached from its visible
        // infected end, or from its susceptible end when the infected one is
        // off screen.
        let edge_alpha = active_edge_alpha(phase);
        for &idx in &self.visible {
            let status = status_of(idx);
            let wanted = match status {
                Status::Infected => Status::Susceptible,
                Status::Susceptible => Status::Infected,
                _ => continue,
            };
            for &other in network.neighbors(idx) {
                if status_of(other) != wanted {
                    continue;
                }
                if status == Status::Susceptible && self.visible_mask[other] {
                    continue;
                }
                if let (Some(a), Some(b)) = (scene.screen_position(idx), scene.screen_position(other)) {
                    self.active
                        .line(a, b, style.active_edge_width, style.active_edge, edge_alpha);
                    stats.active_edges += 1;
                }
            }
        }

        for &idx in &self.visible {
            let status = status_of(idx);
            if status == Status::Susceptible {
                continue;
            }
            let Some(pos) = scene.screen_position(idx) else {
                continue;
            };
            let size = style.radius(status);
            if status == Status::Infected {
                let [outer, inner] = halo_rings(size, phase);
                self.active
                    .stroke_circle(pos, outer.0 * scale, 2.0, style.infected, outer.1);
                self.active
                    .stroke_circle(pos, inner.0 * scale, 1.5, style.infected, inner.1);
                stats.halos += 2;
            }
            let color = style.color(status);
            self.active.fill_circle(pos, size * scale, color, 1.0);
            let outline = if status == Status::Infected {
                style.infected_outline
            } else {
                color
            };
            self.active
                .stroke_circle(pos, size * scale, style.outline_width, outline, 1.0);
            stats.active_entities += 1;
        }
        stats
    }

    /// Focuses the scene on the hotspot; the next tick redraws the base layer.
    pub fn go_to_hotspot(&self, scene: &mut Scene, world: &WorldState) -> Option<EntityId> {
        scene.go_to_hotspot(world)
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn style(&self) -> &RenderStyle {
        &self.style
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn base_layer(&self) -> &S {
        &self.base
    }

    pub fn heat_layer(&self) -> &S {
        &self.heat
    }

    pub fn active_layer(&self) -> &S {
        &self.active
    }
}

impl RenderPipeline<RasterSurface> {
    /// Flattens background, base, heat and active layers into one image.
    pub fn composite(&self) -> RgbaImage {
        let (width, height) = self.base.size();
        let mut out = RasterSurface::with_size(width, height);
        out.fill(self.style.background);
        out.draw_over(&self.base);
        out.draw_over(&self.heat);
        out.draw_over(&self.active);
        out.into_image()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epiview_space::IndexConfig;
    use crate::event::StepEvent;
    use crate::graph::{GraphSnapshot, LinkRecord, NodeRecord};
    use crate::viewport::ViewportConfig;
    use approx::assert_relative_eq;

    /// Five entities on a line, 0-1-2-3-4, in two zones.
    fn scene() -> Scene {
        let nodes = (0..5u32)
            .map(|id| NodeRecord {
                id,
                x: f64::from(id) * 25.0,
                y: f64::from(id) * 25.0,
                zone: id / 3,
            })
            .collect();
        let links = (0..4u32)
            .map(|id| LinkRecord {
                source: id,
                target: id + 1,
            })
            .collect();
        let mut scene = Scene::new(
            Vector2::new(500.0, 400.0),
            ViewportConfig::default(),
            IndexConfig::default(),
        );
        scene.load(&GraphSnapshot { nodes, links }).unwrap();
        scene
    }

    fn pipeline() -> RenderPipeline<RecordingSurface> {
        RenderPipeline::new(RenderStyle::default(), 500, 400)
    }

    fn apply(world: &mut WorldState, event: StepEvent) {
        let index = world.next_index();
        world.apply_event(index, &event).unwrap();
    }

    #[test]
    fn test_base_layer_redrawn_only_on_view_change() {
        let mut scene = scene();
        let world = WorldState::new(&scene.network().entity_ids());
        let mut pipeline = pipeline();

        let first = pipeline.draw(&scene, &world).unwrap();
        assert!(first.base_redrawn);
        assert_eq!(first.visible, 5);
        assert_eq!(first.edges_drawn, 4);

        let second = pipeline.draw(&scene, &world).unwrap();
        assert!(!second.base_redrawn);
        assert_eq!(pipeline.base_layer().clears(), 1);

        scene.drag(10.0, 0.0);
        let third = pipeline.draw(&scene, &world).unwrap();
        assert!(third.base_redrawn);
        assert_eq!(pipeline.stats().base_redraws, 2);
        assert_eq!(pipeline.stats().frames, 3);
    }

    #[test]
    fn test_active_layer_edges_and_halos() {
        let scene = scene();
        let mut world = WorldState::new(&scene.network().entity_ids());
        apply(
            &mut world,
            StepEvent {
                new_infected: vec![2],
                new_recovered: vec![4],
                ..StepEvent::default()
            },
        );

        let mut pipeline = pipeline();
        let stats = pipeline.draw(&scene, &world).unwrap();

        // 2 touches susceptible 1 and 3.
        assert_eq!(stats.active_edges, 2);
        assert_eq!(stats.halos, 2);
        assert_eq!(stats.active_entities, 2);

        let layer = pipeline.active_layer();
        let lines = layer.count(|c| matches!(c, DrawCall::Line { .. }));
        assert_eq!(lines, 2);
    }

    #[test]
    fn test_active_edge_alpha_at_frame_zero() {
        let scene = scene();
        let mut world = WorldState::new(&scene.network().entity_ids());
        apply(
            &mut world,
            StepEvent {
                new_infected: vec![0],
                ..StepEvent::default()
            },
        );
        let mut pipeline = pipeline();
        pipeline.draw(&scene, &world).unwrap();

        let alpha = pipeline.active_layer().calls().iter().find_map(|c| match c {
            DrawCall::Line { alpha, .. } => Some(*alpha),
            _ => None,
        });
        assert_relative_eq!(alpha.unwrap(), 0.4);
    }

    #[test]
    fn test_edge_with_one_visible_endpoint_is_drawn() {
        let mut scene = scene();
        let mut world = WorldState::new(&scene.network().entity_ids());
        apply(
            &mut world,
            StepEvent {
                new_infected: vec![1],
                ..StepEvent::default()
            },
        );

        // Zoom hard onto entity 0 so entity 1 falls outside the culled view.
        let corner = scene.screen_position(0).unwrap();
        scene.viewport_mut().zoom_at(corner, 10.0);
        scene.drag(250.0 - corner.x, 200.0 - corner.y);

        let mut pipeline = pipeline();
        let stats = pipeline.draw(&scene, &world).unwrap();
        assert_eq!(stats.visible, 1);
        assert_eq!(stats.edges_drawn, 1);
        assert_eq!(stats.active_edges, 1);
        assert_eq!(stats.active_entities, 0);
    }

    #[test]
    fn test_inactive_loop_draws_nothing() {
        let scene = scene();
        let world = WorldState::new(&scene.network().entity_ids());
        let mut pipeline = pipeline();

        pipeline.draw(&scene, &world).unwrap();
        pipeline.set_active(false);
        assert!(pipeline.draw(&scene, &world).is_none());
        assert_eq!(pipeline.frame(), 1);

        pipeline.set_active(true);
        let stats = pipeline.draw(&scene, &world).unwrap();
        assert_eq!(stats.frame, 1);
        assert!(!stats.base_redrawn);
    }

    #[test]
    fn test_heat_layer_follows_applied_step() {
        let scene = scene();
        let mut world = WorldState::new(&scene.network().entity_ids());
        let mut pipeline = pipeline();

        let mut event = StepEvent::default();
        event.zone_updates.insert(0, 4.0);
        event.zone_updates.insert(1, 0.05);
        apply(&mut world, event);

        let first = pipeline.draw(&scene, &world).unwrap();
        assert!(first.heat_redrawn);
        assert_eq!(first.heat_zones, 1);

        let second = pipeline.draw(&scene, &world).unwrap();
        assert!(!second.heat_redrawn);

        let mut event = StepEvent::default();
        event.zone_updates.insert(1, 25.0);
        apply(&mut world, event);
        let third = pipeline.draw(&scene, &world).unwrap();
        assert!(third.heat_redrawn);
        assert_eq!(third.heat_zones, 2);

        let saturated = pipeline.heat_layer().calls().iter().find_map(|c| match c {
            DrawCall::Gradient { alpha, blend, .. } if *alpha > 0.5 => Some(*blend),
            _ => None,
        });
        assert_eq!(saturated, Some(BlendMode::Additive));
    }

    #[test]
    fn test_heat_layer_redrawn_after_restart_at_same_step() {
        let scene = scene();
        let ids = scene.network().entity_ids();
        let mut world = WorldState::new(&ids);
        let mut pipeline = pipeline();

        let mut event = StepEvent::default();
        event.zone_updates.insert(0, 5.0);
        apply(&mut world, event);
        let first = pipeline.draw(&scene, &world).unwrap();
        assert_eq!(first.heat_zones, 1);

        // New run reaches step 0 again before the next frame, with no loads.
        world.reset(&ids);
        apply(&mut world, StepEvent::default());
        assert_eq!(world.last_applied(), Some(0));

        let second = pipeline.draw(&scene, &world).unwrap();
        assert!(second.heat_redrawn);
        assert_eq!(second.heat_zones, 0);
        let gradients = pipeline
            .heat_layer()
            .count(|c| matches!(c, DrawCall::Gradient { .. }));
        assert_eq!(gradients, 0);
    }

    #[test]
    fn test_heatmap_disabled() {
        let scene = scene();
        let mut world = WorldState::new(&scene.network().entity_ids());
        let mut event = StepEvent::default();
        event.zone_updates.insert(0, 4.0);
        apply(&mut world, event);

        let style = RenderStyle {
            heatmap: false,
            ..RenderStyle::default()
        };
        let mut pipeline: RenderPipeline<RecordingSurface> = RenderPipeline::new(style, 500, 400);
        let stats = pipeline.draw(&scene, &world).unwrap();
        assert!(!stats.heat_redrawn);
        assert!(pipeline.heat_layer().calls().is_empty());
    }

    #[test]
    fn test_halo_rings() {
        let [outer, inner] = halo_rings(10.0, 0.0);
        assert_relative_eq!(outer.0, 14.0);
        assert_relative_eq!(inner.0, 13.0, epsilon = 1e-12);
        assert_relative_eq!(outer.1, 0.5 - 4.0 / 12.0);
        assert!(inner.1 >= 0.0);
    }

    #[test]
    fn test_resize_reallocates_layers() {
        let mut scene = scene();
        let world = WorldState::new(&scene.network().entity_ids());
        let mut pipeline = pipeline();
        pipeline.draw(&scene, &world).unwrap();

        scene.resize(Vector2::new(640.0, 480.0));
        let stats = pipeline.draw(&scene, &world).unwrap();
        assert!(stats.base_redrawn);
        assert_eq!(pipeline.base_layer().size(), (640, 480));
    }

    #[test]
    fn test_raster_composite() {
        let scene = scene();
        let mut world = WorldState::new(&scene.network().entity_ids());
        apply(
            &mut world,
            StepEvent {
                new_infected: vec![2],
                ..StepEvent::default()
            },
        );
        let mut pipeline: RenderPipeline<RasterSurface> =
            RenderPipeline::new(RenderStyle::default(), 500, 400);
        pipeline.draw(&scene, &world).unwrap();

        let image = pipeline.composite();
        assert_eq!(image.dimensions(), (500, 400));
        assert_eq!(image.get_pixel(0, 0).0, [0x0f, 0x17, 0x2a, 255]);

        let center = scene.screen_position(2).unwrap();
        let px = image.get_pixel(center.x as u32, center.y as u32);
        assert_eq!(px.0, [0xef, 0x44, 0x44, 255]);
    }
}
