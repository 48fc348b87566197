//! Octree Neighbour Index.
//!
//! Partitions 3-D space with a recursive **Octree** over indexed points so
//! the statistical outlier filter can answer k-nearest-neighbour queries
//! without an O(n²) scan.
//!
//! # Key types
//!
//! | Type | Role |
//! |------|------|
//! | [`Aabb`]   | An axis-aligned bounding box.                              |
//! | [`Octree`] | Spatial index; insert `(index, point)`, query neighbours.  |
//!
//! # Example
//!
//! ```rust
//! use mapfuse_perception::octree::Octree;
//! use mapfuse_types::Point;
//!
//! let points = [
//!     Point::new(0.0, 0.0, 0.0),
//!     Point::new(1.0, 0.0, 0.0),
//!     Point::new(5.0, 5.0, 5.0),
//! ];
//! let tree = Octree::from_points(&points, 8).unwrap();
//!
//! let nearest = tree.k_nearest(&Point::new(0.1, 0.0, 0.0), 2, None);
//! assert_eq!(nearest[0].0, 0);
//! assert_eq!(nearest[1].0, 1);
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use mapfuse_types::Point;

/// Depth at which subdivision stops regardless of occupancy, so clusters of
/// identical points terminate.
const DEFAULT_MAX_DEPTH: usize = 16;

// ────────────────────────────────────────────────────────────────────────────
// Aabb
// ────────────────────────────────────────────────────────────────────────────

/// An axis-aligned bounding box, defined by its minimum and maximum corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point,
    pub max: Point,
}

impl Aabb {
    /// Create a bounding box from its two opposite corners.
    ///
    /// The constructor normalises the corners so that `min ≤ max` per axis.
    pub fn new(a: Point, b: Point) -> Self {
        Self {
            min: Point::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Point::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    pub fn centre(&self) -> Point {
        Point::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
            (self.min.z + self.max.z) * 0.5,
        )
    }

    /// True when the point lies inside or on the boundary of the box.
    pub fn contains_point(&self, p: &Point) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// True when `other` overlaps (intersects or touches) this box.
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Squared distance from `p` to the closest point of the box (0 inside).
    pub fn distance_sq_to(&self, p: &Point) -> f64 {
        let axis = |v: f64, lo: f64, hi: f64| {
            if v < lo {
                lo - v
            } else if v > hi {
                v - hi
            } else {
                0.0
            }
        };
        let dx = axis(p.x, self.min.x, self.max.x);
        let dy = axis(p.y, self.min.y, self.max.y);
        let dz = axis(p.z, self.min.z, self.max.z);
        dx * dx + dy * dy + dz * dz
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Octree
// ────────────────────────────────────────────────────────────────────────────

/// A recursive spatial index that subdivides 3-D space into eight octants.
///
/// Each entry is an `(index, point)` pair where `index` is the point's
/// position in the caller's cloud.  Subdivision stops when a leaf holds at
/// most `capacity` entries or `max_depth` levels exist.
#[derive(Debug)]
pub struct Octree {
    root: OctreeNode,
    max_depth: usize,
}

impl Octree {
    /// Create an empty octree covering `bounds`.
    pub fn new(bounds: Aabb, capacity: usize) -> Self {
        Self::with_max_depth(bounds, capacity, DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(bounds: Aabb, capacity: usize, max_depth: usize) -> Self {
        Self {
            root: OctreeNode::new(bounds, capacity.max(1)),
            max_depth,
        }
    }

    /// Index every finite point of `points` under its slice position.
    ///
    /// Returns `None` when `points` holds no finite point.
    pub fn from_points(points: &[Point], capacity: usize) -> Option<Self> {
        let mut finite = points.iter().filter(|p| p.is_finite());
        let first = finite.next()?;
        let (mut min, mut max) = (*first, *first);
        for p in finite {
            min = Point::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z));
            max = Point::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z));
        }
        let mut tree = Self::new(Aabb::new(min, max), capacity);
        for (index, p) in points.iter().enumerate() {
            if p.is_finite() {
                tree.insert(index, *p);
            }
        }
        Some(tree)
    }

    /// Insert an entry.  Returns `false` (and stores nothing) when the point
    /// lies outside the root bounding box.
    pub fn insert(&mut self, index: usize, point: Point) -> bool {
        self.root.insert(Entry { index, point }, self.max_depth, 0)
    }

    pub fn len(&self) -> usize {
        self.root.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of all entries inside `region`.
    pub fn query_aabb(&self, region: &Aabb) -> Vec<usize> {
        let mut out = Vec::new();
        self.root.query_aabb(region, &mut out);
        out
    }

    /// The `k` entries closest to `query`, nearest first, as
    /// `(index, squared distance)`.  An entry whose index equals `exclude` is
    /// skipped (used to leave a point out of its own neighbourhood).
    pub fn k_nearest(&self, query: &Point, k: usize, exclude: Option<usize>) -> Vec<(usize, f64)> {
        if k == 0 {
            return Vec::new();
        }

        let mut best: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        let mut frontier: BinaryHeap<Frontier<'_>> = BinaryHeap::new();
        frontier.push(Frontier {
            dist_sq: self.root.bounds.distance_sq_to(query),
            node: &self.root,
        });

        while let Some(Frontier { dist_sq, node }) = frontier.pop() {
            if best.len() == k && best.peek().is_some_and(|worst| dist_sq > worst.dist_sq) {
                break;
            }
            match &node.children {
                None => {
                    for entry in &node.entries {
                        if exclude == Some(entry.index) {
                            continue;
                        }
                        let d = entry.point.distance_sq(query);
                        if best.len() < k {
                            best.push(Candidate { dist_sq: d, index: entry.index });
                        } else if best.peek().is_some_and(|worst| d < worst.dist_sq) {
                            best.pop();
                            best.push(Candidate { dist_sq: d, index: entry.index });
                        }
                    }
                }
                Some(children) => {
                    for child in children.iter() {
                        frontier.push(Frontier {
                            dist_sq: child.bounds.distance_sq_to(query),
                            node: child,
                        });
                    }
                }
            }
        }

        let mut out: Vec<(usize, f64)> = best.into_iter().map(|c| (c.index, c.dist_sq)).collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        out
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Search bookkeeping
// ────────────────────────────────────────────────────────────────────────────

/// Max-heap element: the worst current neighbour sits on top.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    dist_sq: f64,
    index: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then(self.index.cmp(&other.index))
    }
}

/// Min-heap element (ordering reversed): the closest unexplored node first.
struct Frontier<'a> {
    dist_sq: f64,
    node: &'a OctreeNode,
}

impl PartialEq for Frontier<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.dist_sq.total_cmp(&other.dist_sq) == Ordering::Equal
    }
}

impl Eq for Frontier<'_> {}

impl PartialOrd for Frontier<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.dist_sq.total_cmp(&self.dist_sq)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OctreeNode – internal implementation
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Entry {
    index: usize,
    point: Point,
}

#[derive(Debug)]
struct OctreeNode {
    bounds: Aabb,
    capacity: usize,
    /// Entries stored at this node (only non-empty when the node is a leaf).
    entries: Vec<Entry>,
    /// Eight children; `None` while this node is a leaf.
    children: Option<Box<[OctreeNode; 8]>>,
}

impl OctreeNode {
    fn new(bounds: Aabb, capacity: usize) -> Self {
        Self {
            bounds,
            capacity,
            entries: Vec::new(),
            children: None,
        }
    }

    fn count(&self) -> usize {
        match &self.children {
            None => self.entries.len(),
            Some(children) => children.iter().map(|c| c.count()).sum(),
        }
    }

    fn insert(&mut self, entry: Entry, max_depth: usize, depth: usize) -> bool {
        if !self.bounds.contains_point(&entry.point) {
            return false;
        }

        match self.children.as_mut() {
            None => {
                self.entries.push(entry);
                if self.entries.len() > self.capacity && depth < max_depth {
                    self.subdivide(max_depth, depth);
                }
                true
            }
            Some(children) => children
                .iter_mut()
                .any(|child| child.insert(entry, max_depth, depth + 1)),
        }
    }

    fn query_aabb(&self, region: &Aabb, out: &mut Vec<usize>) {
        if !self.bounds.overlaps(region) {
            return;
        }
        match &self.children {
            None => out.extend(
                self.entries
                    .iter()
                    .filter(|e| region.contains_point(&e.point))
                    .map(|e| e.index),
            ),
            Some(children) => {
                for child in children.iter() {
                    child.query_aabb(region, out);
                }
            }
        }
    }

    /// Split this leaf into eight children and redistribute its entries.
    fn subdivide(&mut self, max_depth: usize, depth: usize) {
        let c = self.bounds.centre();
        let min = self.bounds.min;
        let max = self.bounds.max;

        let octants = [
            Aabb::new(min, c),
            Aabb::new(Point::new(c.x, min.y, min.z), Point::new(max.x, c.y, c.z)),
            Aabb::new(Point::new(min.x, c.y, min.z), Point::new(c.x, max.y, c.z)),
            Aabb::new(Point::new(c.x, c.y, min.z), Point::new(max.x, max.y, c.z)),
            Aabb::new(Point::new(min.x, min.y, c.z), Point::new(c.x, c.y, max.z)),
            Aabb::new(Point::new(c.x, min.y, c.z), Point::new(max.x, c.y, max.z)),
            Aabb::new(Point::new(min.x, c.y, c.z), Point::new(c.x, max.y, max.z)),
            Aabb::new(c, max),
        ];

        let cap = self.capacity;
        let mut children = Box::new(octants.map(|b| OctreeNode::new(b, cap)));

        // Boundary points go to the first child that contains them.
        for entry in std::mem::take(&mut self.entries) {
            for child in children.iter_mut() {
                if child.insert(entry, max_depth, depth + 1) {
                    break;
                }
            }
        }

        self.children = Some(children);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
