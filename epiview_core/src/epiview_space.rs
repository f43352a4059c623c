//! The "SPACE" Engine - region quadtree over screen-space points
//!
//! Answers "which entities are inside this rectangle" without scanning every
//! entity. The render pipeline queries it once per animation frame with the
//! visible rectangle, so the tree is built once per viewport-size or
//! data-bounds change and then only read.
//!
//! Nodes live in a flat arena; a leaf holds up to `capacity` points and
//! splits into four equal quadrants on overflow, handing its points down.
//! Subdivision stops at `max_depth`, where a leaf simply keeps growing (this
//! is what happens when many points share one coordinate).

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Axis-aligned rectangle with inclusive edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// Builds the smallest rectangle covering every point (`None` when empty).
    pub fn covering(points: impl IntoIterator<Item = (f64, f64)>) -> Option<Self> {
        let mut iter = points.into_iter();
        let (x, y) = iter.next()?;
        let mut rect = Self::new(x, y, x, y);
        for (x, y) in iter {
            rect.min_x = rect.min_x.min(x);
            rect.min_y = rect.min_y.min(y);
            rect.max_x = rect.max_x.max(x);
            rect.max_y = rect.max_y.max(y);
        }
        Some(rect)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Disjoint iff separated on either axis.
    pub fn intersects(&self, other: &Rect) -> bool {
        !(other.min_x > self.max_x
            || other.max_x < self.min_x
            || other.min_y > self.max_y
            || other.max_y < self.min_y)
    }

    /// Grows the rectangle by `margin` on every side.
    pub fn inflate(&self, margin: f64) -> Self {
        Self::new(
            self.min_x - margin,
            self.min_y - margin,
            self.max_x + margin,
            self.max_y + margin,
        )
    }

    fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) * 0.5,
            (self.min_y + self.max_y) * 0.5,
        )
    }

    /// Quadrants in NW, NE, SW, SE order.
    fn quadrants(&self) -> [Rect; 4] {
        let (cx, cy) = self.center();
        [
            Rect::new(self.min_x, self.min_y, cx, cy),
            Rect::new(cx, self.min_y, self.max_x, cy),
            Rect::new(self.min_x, cy, cx, self.max_y),
            Rect::new(cx, cy, self.max_x, self.max_y),
        ]
    }

    /// Index of the quadrant a contained point descends into.
    fn quadrant_of(&self, x: f64, y: f64) -> usize {
        let (cx, cy) = self.center();
        let east = usize::from(x >= cx);
        let south = usize::from(y >= cy);
        south * 2 + east
    }
}

/// A point plus its opaque payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedPoint<T> {
    pub x: f64,
    pub y: f64,
    pub payload: T,
}

impl<T> IndexedPoint<T> {
    pub fn new(x: f64, y: f64, payload: T) -> Self {
        Self { x, y, payload }
    }
}

/// Tuning for the quadtree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Points per leaf before it splits (default: 4)
    pub capacity: usize,

    /// Depth at which leaves stop splitting and accept overflow (default: 16)
    pub max_depth: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            max_depth: 16,
        }
    }
}

#[derive(Debug, Clone)]
struct QuadNode<T> {
    bounds: Rect,
    depth: u32,
    points: Vec<IndexedPoint<T>>,
    /// Arena indices of the NW, NE, SW, SE children once split
    children: Option<[usize; 4]>,
}

impl<T> QuadNode<T> {
    fn leaf(bounds: Rect, depth: u32) -> Self {
        Self {
            bounds,
            depth,
            points: Vec::new(),
            children: None,
        }
    }
}

/// Region quadtree answering rectangle queries.
#[derive(Debug, Clone)]
pub struct QuadTree<T> {
    nodes: Vec<QuadNode<T>>,
    config: IndexConfig,
    len: usize,
    rejected: usize,
    deepest: u32,
}

impl<T: Copy> QuadTree<T> {
    /// Creates an empty tree over a fixed region.
    pub fn new(bounds: Rect, config: IndexConfig) -> Self {
        let config = IndexConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            nodes: vec![QuadNode::leaf(bounds, 0)],
            config,
            len: 0,
            rejected: 0,
            deepest: 0,
        }
    }

    /// Builds a tree over `bounds` containing `points`.
    ///
    /// Points outside `bounds` are rejected and counted.
    pub fn build(
        points: impl IntoIterator<Item = IndexedPoint<T>>,
        bounds: Rect,
        config: IndexConfig,
    ) -> Self {
        let mut tree = Self::new(bounds, config);
        for point in points {
            tree.insert(point);
        }
        if tree.rejected > 0 {
            warn!(
                rejected = tree.rejected,
                "points outside index bounds were not indexed"
            );
        }
        tree
    }

    /// Inserts a point; returns `false` when it lies outside the root bounds.
    pub fn insert(&mut self, point: IndexedPoint<T>) -> bool {
        if !self.nodes[0].bounds.contains(point.x, point.y) {
            self.rejected += 1;
            return false;
        }

        let mut idx = 0;
        loop {
            if let Some(children) = self.nodes[idx].children {
                let quadrant = self.nodes[idx].bounds.quadrant_of(point.x, point.y);
                idx = children[quadrant];
                continue;
            }

            let node = &self.nodes[idx];
            if node.points.len() < self.config.capacity || node.depth >= self.config.max_depth {
                self.nodes[idx].points.push(point);
                self.deepest = self.deepest.max(self.nodes[idx].depth);
                self.len += 1;
                return true;
            }

            self.subdivide(idx);
        }
    }

    /// Splits a full leaf into four quadrants and redistributes its points.
    fn subdivide(&mut self, idx: usize) {
        let bounds = self.nodes[idx].bounds;
        let depth = self.nodes[idx].depth + 1;
        let first = self.nodes.len();
        for quadrant in bounds.quadrants() {
            self.nodes.push(QuadNode::leaf(quadrant, depth));
        }
        let children = [first, first + 1, first + 2, first + 3];

        let points = std::mem::take(&mut self.nodes[idx].points);
        self.nodes[idx].children = Some(children);
        for point in points {
            let child = children[bounds.quadrant_of(point.x, point.y)];
            self.nodes[child].points.push(point);
        }
        self.deepest = self.deepest.max(depth);
    }

    /// Returns the payload of every point inside `range`.
    pub fn query(&self, range: &Rect) -> Vec<T> {
        let mut found = Vec::new();
        self.query_into(range, &mut found);
        found
    }

    /// Appends matches to `found`, for per-frame callers reusing a buffer.
    pub fn query_into(&self, range: &Rect, found: &mut Vec<T>) {
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if !node.bounds.intersects(range) {
                continue;
            }
            found.extend(
                node.points
                    .iter()
                    .filter(|p| range.contains(p.x, p.y))
                    .map(|p| p.payload),
            );
            if let Some(children) = node.children {
                stack.extend(children);
            }
        }
    }

    /// Number of indexed points.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Root bounds.
    pub fn bounds(&self) -> Rect {
        self.nodes[0].bounds
    }

    /// Get statistics about the index
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            points: self.len,
            nodes: self.nodes.len(),
            max_depth: self.deepest,
            rejected: self.rejected,
        }
    }
}

/// Statistics about the spatial index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub points: usize,
    pub nodes: usize,
    pub max_depth: u32,
    pub rejected: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn brute_force(points: &[IndexedPoint<usize>], range: &Rect) -> Vec<usize> {
        let mut hits: Vec<usize> = points
            .iter()
            .filter(|p| range.contains(p.x, p.y))
            .map(|p| p.payload)
            .collect();
        hits.sort_unstable();
        hits
    }

    #[test]
    fn test_empty_tree() {
        let tree: QuadTree<u32> =
            QuadTree::new(Rect::new(0.0, 0.0, 100.0, 100.0), IndexConfig::default());
        assert!(tree.is_empty());
        assert!(tree.query(&Rect::new(0.0, 0.0, 100.0, 100.0)).is_empty());
    }

    #[test]
    fn test_query_subset() {
        let points = vec![
            IndexedPoint::new(10.0, 10.0, 1u32),
            IndexedPoint::new(90.0, 90.0, 2),
            IndexedPoint::new(50.0, 50.0, 3),
            IndexedPoint::new(12.0, 80.0, 4),
            IndexedPoint::new(80.0, 12.0, 5),
            IndexedPoint::new(15.0, 15.0, 6),
        ];
        let tree = QuadTree::build(points, Rect::new(0.0, 0.0, 100.0, 100.0), IndexConfig::default());
        assert_eq!(tree.len(), 6);
        assert!(tree.stats().nodes > 1, "six points at capacity 4 must split");

        let mut hits = tree.query(&Rect::new(0.0, 0.0, 20.0, 20.0));
        hits.sort_unstable();
        assert_eq!(hits, vec![1, 6]);
    }

    #[test]
    fn test_inclusive_edges() {
        let tree = QuadTree::build(
            vec![IndexedPoint::new(50.0, 50.0, 7u32)],
            Rect::new(0.0, 0.0, 100.0, 100.0),
            IndexConfig::default(),
        );
        assert_eq!(tree.query(&Rect::new(50.0, 50.0, 60.0, 60.0)), vec![7]);
        assert_eq!(tree.query(&Rect::new(40.0, 40.0, 50.0, 50.0)), vec![7]);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let tree = QuadTree::build(
            vec![
                IndexedPoint::new(5.0, 5.0, 1u32),
                IndexedPoint::new(500.0, 5.0, 2),
            ],
            Rect::new(0.0, 0.0, 10.0, 10.0),
            IndexConfig::default(),
        );
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.stats().rejected, 1);
    }

    #[test]
    fn test_coincident_points_bounded_depth() {
        let config = IndexConfig {
            capacity: 4,
            max_depth: 8,
        };
        let points = (0..100u32).map(|i| IndexedPoint::new(3.0, 3.0, i));
        let tree = QuadTree::build(points, Rect::new(0.0, 0.0, 10.0, 10.0), config);

        assert_eq!(tree.len(), 100);
        assert_eq!(tree.stats().max_depth, 8);
        assert_eq!(tree.query(&Rect::new(2.0, 2.0, 4.0, 4.0)).len(), 100);
    }

    #[test]
    fn test_query_is_idempotent() {
        let points = (0..50u32).map(|i| IndexedPoint::new(i as f64 * 2.0, (i % 7) as f64 * 10.0, i));
        let tree = QuadTree::build(points, Rect::new(0.0, 0.0, 100.0, 100.0), IndexConfig::default());
        let range = Rect::new(10.0, 0.0, 60.0, 35.0);

        let mut first = tree.query(&range);
        let mut second = tree.query(&range);
        first.sort_unstable();
        second.sort_unstable();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rect_intersects() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert!(a.intersects(&Rect::new(5.0, 5.0, 15.0, 15.0)));
        assert!(a.intersects(&Rect::new(10.0, 0.0, 20.0, 10.0)));
        assert!(!a.intersects(&Rect::new(10.1, 0.0, 20.0, 10.0)));
        assert!(!a.intersects(&Rect::new(0.0, -5.0, 10.0, -0.1)));
    }

    proptest! {
        #[test]
        fn prop_query_matches_brute_force(
            coords in prop::collection::vec((0.0f64..1000.0, 0.0f64..1000.0), 0..400),
            capacity in 1usize..12,
            (ax, bx) in (0.0f64..1000.0, 0.0f64..1000.0),
            (ay, by) in (0.0f64..1000.0, 0.0f64..1000.0),
        ) {
            let points: Vec<IndexedPoint<usize>> = coords
                .iter()
                .enumerate()
                .map(|(i, &(x, y))| IndexedPoint::new(x, y, i))
                .collect();
            let config = IndexConfig { capacity, ..IndexConfig::default() };
            let tree = QuadTree::build(points.clone(), Rect::new(0.0, 0.0, 1000.0, 1000.0), config);
            let range = Rect::new(ax.min(bx), ay.min(by), ax.max(bx), ay.max(by));

            let mut hits = tree.query(&range);
            hits.sort_unstable();
            prop_assert_eq!(hits, brute_force(&points, &range));
        }
    }
}
