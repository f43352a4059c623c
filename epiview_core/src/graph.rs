//! Contact network loaded from the graph snapshot.

use crate::epiview_space::Rect;
use crate::epiview_world::{Status, WorldState};
use crate::error::CoreError;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Stable entity identity.
pub type EntityId = u32;

/// Community / zone identity.
pub type ZoneId = u32;

// ============================================================================
// WIRE FORMAT
// ============================================================================

/// Node as delivered by the graph snapshot endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: EntityId,
    pub x: f64,
    pub y: f64,
    #[serde(default, alias = "community")]
    pub zone: ZoneId,
}

/// Undirected contact edge as delivered by the snapshot endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub source: EntityId,
    pub target: EntityId,
}

/// The full snapshot: every entity and every contact edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeRecord>,
    #[serde(default, alias = "edges")]
    pub links: Vec<LinkRecord>,
}

impl GraphSnapshot {
    pub fn from_json(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ============================================================================
// NETWORK
// ============================================================================

/// One simulated individual. Position and zone never change in a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub position: Vector2<f64>,
    pub zone: ZoneId,
}

/// Resolved contact network with dense indices.
///
/// Entities are addressed by their position in `entities` everywhere inside
/// the engine; `EntityId` only appears at the event and snapshot boundaries.
#[derive(Debug, Clone, Default)]
pub struct Network {
    entities: Vec<Entity>,
    index_of: HashMap<EntityId, usize>,
    edges: Vec<(usize, usize)>,
    adjacency: Vec<Vec<usize>>,
    skipped_edges: usize,
    generation: u64,
}

impl Network {
    /// Resolves a snapshot into a network.
    ///
    /// Edges naming unknown entities and self-loops are skipped and counted.
    /// Duplicate node ids keep their first occurrence. Non-finite positions
    /// are rejected.
    pub fn from_snapshot(snapshot: &GraphSnapshot, generation: u64) -> Result<Self, CoreError> {
        let mut entities = Vec::with_capacity(snapshot.nodes.len());
        let mut index_of = HashMap::with_capacity(snapshot.nodes.len());

        for node in &snapshot.nodes {
            if !node.x.is_finite() || !node.y.is_finite() {
                return Err(CoreError::Graph(format!(
                    "entity {} has non-finite position",
                    node.id
                )));
            }
            if index_of.contains_key(&node.id) {
                warn!(id = node.id, "duplicate entity in snapshot, keeping first");
                continue;
            }
            index_of.insert(node.id, entities.len());
            entities.push(Entity {
                id: node.id,
                position: Vector2::new(node.x, node.y),
                zone: node.zone,
            });
        }

        let mut edges = Vec::with_capacity(snapshot.links.len());
        let mut adjacency = vec![Vec::new(); entities.len()];
        let mut skipped_edges = 0;
        for link in &snapshot.links {
            match (index_of.get(&link.source), index_of.get(&link.target)) {
                (Some(&a), Some(&b)) if a != b => {
                    edges.push((a, b));
                    adjacency[a].push(b);
                    adjacency[b].push(a);
                }
                _ => skipped_edges += 1,
            }
        }
        if skipped_edges > 0 {
            warn!(skipped_edges, "snapshot edges referencing unknown entities were skipped");
        }

        info!(
            entities = entities.len(),
            edges = edges.len(),
            "contact network loaded"
        );

        Ok(Self {
            entities,
            index_of,
            edges,
            adjacency,
            skipped_edges,
            generation,
        })
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, idx: usize) -> Option<&Entity> {
        self.entities.get(idx)
    }

    pub fn index_of(&self, id: EntityId) -> Option<usize> {
        self.index_of.get(&id).copied()
    }

    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    pub fn neighbors(&self, idx: usize) -> &[usize] {
        self.adjacency.get(idx).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| e.id).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn skipped_edges(&self) -> usize {
        self.skipped_edges
    }

    /// Snapshot generation, bumped whenever a new snapshot is loaded.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Data-space bounding box of all entities.
    pub fn data_bounds(&self) -> Option<Rect> {
        Rect::covering(self.entities.iter().map(|e| (e.position.x, e.position.y)))
    }

    /// Entity with the most contact edges while infected.
    ///
    /// Edges are scanned in snapshot order and each infected endpoint is
    /// credited once per incident edge. Ties go to whichever entity was
    /// encountered first.
    pub fn hotspot(&self, world: &WorldState) -> Option<usize> {
        let infected =
            |idx: usize| world.status(self.entities[idx].id) == Some(Status::Infected);

        let mut counts: HashMap<usize, usize> = HashMap::new();
        let mut encounter_order = Vec::new();
        for &(a, b) in &self.edges {
            for idx in [a, b] {
                if infected(idx) {
                    let count = counts.entry(idx).or_insert_with(|| {
                        encounter_order.push(idx);
                        0
                    });
                    *count += 1;
                }
            }
        }

        let mut best: Option<(usize, usize)> = None;
        for idx in encounter_order {
            let count = counts[&idx];
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((idx, count));
            }
        }
        best.map(|(idx, _)| idx)
    }
}
