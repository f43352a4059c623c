//! Scene - the network as laid out on the current canvas.
//!
//! Owns the viewport and every cache derived from it:
//!
//! ```text
//!   GraphSnapshot ──▶ Network ──fit_to_data──▶ base-screen positions ──▶ QuadTree
//!                                                      │
//!                                                      └──▶ zone centroids
//! ```
//!
//! The caches are rebuilt on snapshot load and canvas resize, never per
//! frame. Pan and zoom leave them untouched because queries run in
//! base-screen space.

use crate::epiview_space::{IndexConfig, IndexStats, IndexedPoint, QuadTree, Rect};
use crate::epiview_world::WorldState;
use crate::error::CoreError;
use crate::graph::{EntityId, GraphSnapshot, Network, ZoneId};
use crate::viewport::{ViewKey, ViewportConfig, ViewportTransform};
use nalgebra::Vector2;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Wheel zoom step per notch.
const WHEEL_ZOOM_OUT: f64 = 0.92;
const WHEEL_ZOOM_IN: f64 = 1.08;

/// Everything that invalidates the static base layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BaseKey {
    pub view: ViewKey,
    pub layout: u64,
}

/// Laid-out network plus viewport.
#[derive(Debug, Clone)]
pub struct Scene {
    network: Network,
    viewport: ViewportTransform,
    index_config: IndexConfig,
    base_positions: Vec<Vector2<f64>>,
    zone_centroids: BTreeMap<ZoneId, Vector2<f64>>,
    index: QuadTree<usize>,
    loads: u64,
    layout_generation: u64,
}

impl Scene {
    pub fn new(size: Vector2<f64>, viewport: ViewportConfig, index_config: IndexConfig) -> Self {
        Self {
            network: Network::default(),
            viewport: ViewportTransform::new(size, viewport),
            index_config,
            base_positions: Vec::new(),
            zone_centroids: BTreeMap::new(),
            index: QuadTree::new(Rect::new(0.0, 0.0, size.x, size.y), index_config),
            loads: 0,
            layout_generation: 0,
        }
    }

    /// Replaces the network and fits it to the canvas.
    pub fn load(&mut self, snapshot: &GraphSnapshot) -> Result<(), CoreError> {
        let network = Network::from_snapshot(snapshot, self.loads + 1)?;
        self.loads += 1;

        let size = self.viewport.size();
        let bounds = network
            .data_bounds()
            .unwrap_or_else(|| Rect::new(0.0, 0.0, size.x, size.y));
        self.network = network;
        self.viewport.fit_to_data(bounds, size);
        self.rebuild_layout();
        Ok(())
    }

    /// Canvas resize. Rebuilds positions and index when the size changed.
    pub fn resize(&mut self, size: Vector2<f64>) -> bool {
        if !self.viewport.resize(size) {
            return false;
        }
        self.rebuild_layout();
        true
    }

    fn rebuild_layout(&mut self) {
        let viewport = &self.viewport;
        self.base_positions = self
            .network
            .entities()
            .iter()
            .map(|e| viewport.data_to_base(e.position.x, e.position.y))
            .collect();

        let size = self.viewport.size();
        let bounds = Rect::covering(self.base_positions.iter().map(|p| (p.x, p.y)))
            .map(|r| r.inflate(1.0))
            .unwrap_or_else(|| Rect::new(0.0, 0.0, size.x, size.y));
        self.index = QuadTree::build(
            self.base_positions
                .iter()
                .enumerate()
                .map(|(idx, p)| IndexedPoint::new(p.x, p.y, idx)),
            bounds,
            self.index_config,
        );

        let mut sums: BTreeMap<ZoneId, (Vector2<f64>, usize)> = BTreeMap::new();
        for (entity, pos) in self.network.entities().iter().zip(&self.base_positions) {
            let slot = sums.entry(entity.zone).or_insert((Vector2::zeros(), 0));
            slot.0 += pos;
            slot.1 += 1;
        }
        self.zone_centroids = sums
            .into_iter()
            .map(|(zone, (sum, n))| (zone, sum / n as f64))
            .collect();

        self.layout_generation += 1;

        let stats = self.index.stats();
        debug!(
            points = stats.points,
            nodes = stats.nodes,
            depth = stats.max_depth,
            zones = self.zone_centroids.len(),
            "scene layout rebuilt"
        );
    }

    /// Appends the indices of entities inside the culled view to `out`.
    pub fn visible_into(&self, out: &mut Vec<usize>) {
        out.clear();
        self.index.query_into(&self.viewport.screen_to_world_rect(), out);
    }

    /// Wheel interaction: positive `delta_y` zooms out.
    pub fn wheel(&mut self, anchor: Vector2<f64>, delta_y: f64) {
        let factor = if delta_y > 0.0 {
            WHEEL_ZOOM_OUT
        } else {
            WHEEL_ZOOM_IN
        };
        self.viewport.zoom_at(anchor, factor);
    }

    /// Drag interaction.
    pub fn drag(&mut self, dx: f64, dy: f64) {
        self.viewport.pan(dx, dy);
    }

    /// Focuses the view on the busiest infected entity, if any.
    pub fn go_to_hotspot(&mut self, world: &WorldState) -> Option<EntityId> {
        let idx = self.network.hotspot(world)?;
        let pos = *self.base_positions.get(idx)?;
        self.viewport.focus_on(pos);
        let id = self.network.entity(idx).map(|e| e.id);
        info!(entity = ?id, "focused on hotspot");
        id
    }

    pub fn base_key(&self) -> BaseKey {
        BaseKey {
            view: self.viewport.view_key(),
            layout: self.layout_generation,
        }
    }

    /// Final screen position of an entity.
    pub fn screen_position(&self, idx: usize) -> Option<Vector2<f64>> {
        self.base_positions
            .get(idx)
            .map(|p| self.viewport.to_screen(*p))
    }

    pub fn zone_centroid(&self, zone: ZoneId) -> Option<Vector2<f64>> {
        self.zone_centroids.get(&zone).copied()
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn viewport(&self) -> &ViewportTransform {
        &self.viewport
    }

    pub fn viewport_mut(&mut self) -> &mut ViewportTransform {
        &mut self.viewport
    }

    pub fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StepEvent;
    use crate::graph::{LinkRecord, NodeRecord};
    use approx::assert_relative_eq;

    fn grid_snapshot() -> GraphSnapshot {
        let mut nodes = Vec::new();
        for i in 0..11u32 {
            for j in 0..11u32 {
                nodes.push(NodeRecord {
                    id: i * 11 + j,
                    x: f64::from(i) * 10.0,
                    y: f64::from(j) * 10.0,
                    zone: i % 3,
                });
            }
        }
        let links = (0..120u32)
            .map(|id| LinkRecord {
                source: id,
                target: id + 1,
            })
            .collect();
        GraphSnapshot { nodes, links }
    }

    fn scene() -> Scene {
        let mut scene = Scene::new(
            Vector2::new(500.0, 400.0),
            ViewportConfig::default(),
            IndexConfig::default(),
        );
        scene.load(&grid_snapshot()).unwrap();
        scene
    }

    #[test]
    fn test_load_indexes_everything() {
        let scene = scene();
        assert_eq!(scene.index_stats().points, 121);
        assert_eq!(scene.index_stats().rejected, 0);

        let mut visible = Vec::new();
        scene.visible_into(&mut visible);
        assert_eq!(visible.len(), 121);
    }

    #[test]
    fn test_screen_positions_follow_fit() {
        let scene = scene();
        let corner = scene.screen_position(0).unwrap();
        assert_relative_eq!(corner.x, 50.0, epsilon = 1e-9);
        assert_relative_eq!(corner.y, 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_zoomed_view_culls() {
        let mut scene = scene();
        scene.viewport_mut().zoom_at(Vector2::new(50.0, 50.0), 10.0);

        let mut visible = Vec::new();
        scene.visible_into(&mut visible);
        assert!(!visible.is_empty());
        assert!(visible.len() < 121);
        assert!(visible.contains(&0));
    }

    #[test]
    fn test_base_key_changes_on_interaction_and_reload() {
        let mut scene = scene();
        let key = scene.base_key();
        assert_eq!(scene.base_key(), key);

        scene.drag(3.0, 0.0);
        let dragged = scene.base_key();
        assert_ne!(dragged, key);

        scene.load(&grid_snapshot()).unwrap();
        assert_ne!(scene.base_key(), dragged);
    }

    #[test]
    fn test_resize_rebuilds_layout() {
        let mut scene = scene();
        assert!(!scene.resize(Vector2::new(500.0, 400.0)));
        assert!(scene.resize(Vector2::new(700.0, 400.0)));
        let far = scene.screen_position(120).unwrap();
        assert_relative_eq!(far.x, 650.0, epsilon = 1e-9);
    }

    #[test]
    fn test_wheel_direction() {
        let mut scene = scene();
        scene.wheel(Vector2::new(250.0, 200.0), -1.0);
        assert_relative_eq!(scene.viewport().scale(), 1.08, epsilon = 1e-12);
        scene.wheel(Vector2::new(250.0, 200.0), 1.0);
        assert_relative_eq!(scene.viewport().scale(), 1.08 * 0.92, epsilon = 1e-12);
    }

    #[test]
    fn test_zone_centroids() {
        let scene = scene();
        // Zone 0 holds columns x = 0, 30, 60, 90.
        let centroid = scene.zone_centroid(0).unwrap();
        let expected = scene.viewport().data_to_base(45.0, 50.0);
        assert_relative_eq!(centroid.x, expected.x, epsilon = 1e-9);
        assert_relative_eq!(centroid.y, expected.y, epsilon = 1e-9);
        assert!(scene.zone_centroid(7).is_none());
    }

    #[test]
    fn test_go_to_hotspot_centers_entity() {
        let mut scene = scene();
        let mut world = WorldState::new(&scene.network().entity_ids());
        assert_eq!(scene.go_to_hotspot(&world), None);

        let event = StepEvent {
            new_infected: vec![60],
            ..StepEvent::default()
        };
        world.apply_event(0, &event).unwrap();
        assert_eq!(scene.go_to_hotspot(&world), Some(60));

        let pos = scene.screen_position(60).unwrap();
        assert_relative_eq!(pos.x, 250.0, epsilon = 1e-9);
        assert_relative_eq!(pos.y, 200.0, epsilon = 1e-9);
        assert_relative_eq!(scene.viewport().scale(), 2.0);
    }
}
