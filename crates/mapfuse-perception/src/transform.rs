//! Frame Transform Engine.
//!
//! A [`FrameTransform`] is a planar rigid-body transform (rotation about +Z
//! followed by an XY translation) that maps points expressed in a named
//! sensor frame into its parent frame.  The rotation is stored as a
//! precomputed cos/sin pair so the per-point cost is four multiplies.
//!
//! A [`FrameTree`] keeps a directed graph of named frames and the transforms
//! relating them; [`FrameTree::lookup`] composes the chain from a parent down
//! to any descendant via BFS.
//!
//! # Example
//!
//! ```rust
//! use mapfuse_perception::transform::{FrameTree, FrameTransform, COMMON_FRAME};
//! use mapfuse_types::Point;
//!
//! let mut tree = FrameTree::new();
//! // robot base sits 1 m along +X of the common frame.
//! tree.set_transform(COMMON_FRAME, "base", FrameTransform::new("base", 0.0, 1.0, 0.0));
//! // the laser is mounted 0.5 m forward on the base.
//! tree.set_transform("base", "laser", FrameTransform::new("laser", 0.0, 0.5, 0.0));
//!
//! let t = tree.lookup(COMMON_FRAME, "laser").unwrap();
//! let p = t.transform(&Point::new(0.0, 0.0, 0.0)).unwrap();
//! assert!((p.x - 1.5).abs() < 1e-9);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use mapfuse_types::{MapError, Point};

/// Name of the frame every accumulated point is expressed in.
pub const COMMON_FRAME: &str = "common";

// ────────────────────────────────────────────────────────────────────────────
// FrameTransform
// ────────────────────────────────────────────────────────────────────────────

/// Planar rigid transform from frame `frame_id` into its parent frame.
///
/// `x' = x·cosθ − y·sinθ + dx`, `y' = x·sinθ + y·cosθ + dy`; z and color
/// pass through unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTransform {
    frame_id: String,
    rotation_deg: f64,
    cos: f64,
    sin: f64,
    dx: f64,
    dy: f64,
}

impl FrameTransform {
    /// Build a transform from a rotation in degrees and a translation.
    pub fn new(frame_id: impl Into<String>, rotation_deg: f64, dx: f64, dy: f64) -> Self {
        let rad = rotation_deg.to_radians();
        Self {
            frame_id: frame_id.into(),
            rotation_deg,
            cos: rad.cos(),
            sin: rad.sin(),
            dx,
            dy,
        }
    }

    /// The identity transform (frame coincides with its parent).
    pub fn identity(frame_id: impl Into<String>) -> Self {
        Self::new(frame_id, 0.0, 0.0, 0.0)
    }

    pub fn frame_id(&self) -> &str {
        &self.frame_id
    }

    pub fn rotation_deg(&self) -> f64 {
        self.rotation_deg
    }

    pub fn cos(&self) -> f64 {
        self.cos
    }

    pub fn sin(&self) -> f64 {
        self.sin
    }

    pub fn translation(&self) -> (f64, f64) {
        (self.dx, self.dy)
    }

    /// Map `point` from this transform's frame into the parent frame.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::NonFiniteCoordinate`] when any input coordinate is
    /// NaN or infinite.
    pub fn transform(&self, point: &Point) -> Result<Point, MapError> {
        if !point.is_finite() {
            return Err(MapError::NonFiniteCoordinate {
                x: point.x,
                y: point.y,
                z: point.z,
            });
        }
        Ok(Point {
            x: point.x * self.cos - point.y * self.sin + self.dx,
            y: point.x * self.sin + point.y * self.cos + self.dy,
            ..*point
        })
    }

    /// The transform mapping parent-frame points back into this frame.
    pub fn inverse(&self) -> Self {
        // R⁻¹ = Rᵀ, t⁻¹ = −Rᵀ·t
        Self {
            frame_id: self.frame_id.clone(),
            rotation_deg: -self.rotation_deg,
            cos: self.cos,
            sin: -self.sin,
            dx: -(self.cos * self.dx + self.sin * self.dy),
            dy: self.sin * self.dx - self.cos * self.dy,
        }
    }

    /// Compose two transforms: `inner` applied first, then `self`.
    ///
    /// If `self` = T_A_B and `inner` = T_B_C, the result is T_A_C and carries
    /// `inner`'s frame id.
    pub fn compose(&self, inner: &Self) -> Self {
        Self {
            frame_id: inner.frame_id.clone(),
            rotation_deg: self.rotation_deg + inner.rotation_deg,
            cos: self.cos * inner.cos - self.sin * inner.sin,
            sin: self.sin * inner.cos + self.cos * inner.sin,
            dx: self.cos * inner.dx - self.sin * inner.dy + self.dx,
            dy: self.sin * inner.dx + self.cos * inner.dy + self.dy,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FrameTree
// ────────────────────────────────────────────────────────────────────────────

/// A directed graph of named frames.
///
/// `edges[parent][child]` maps child-frame points into the parent frame.
/// Edges are directional: adding `parent → child` does not create the
/// inverse.
#[derive(Debug, Default)]
pub struct FrameTree {
    edges: HashMap<String, HashMap<String, FrameTransform>>,
}

impl FrameTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the transform of `child_frame` in `parent_frame`.
    pub fn set_transform(&mut self, parent_frame: &str, child_frame: &str, transform: FrameTransform) {
        self.edges
            .entry(parent_frame.to_string())
            .or_default()
            .insert(child_frame.to_string(), transform);
    }

    /// Compose the transform mapping `source_frame` points into
    /// `target_frame`.
    ///
    /// Returns `None` if `source_frame` is not reachable from `target_frame`.
    pub fn lookup(&self, target_frame: &str, source_frame: &str) -> Option<FrameTransform> {
        if target_frame == source_frame {
            return Some(FrameTransform::identity(source_frame));
        }

        let mut queue: VecDeque<(&str, FrameTransform)> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();

        queue.push_back((target_frame, FrameTransform::identity(target_frame)));
        visited.insert(target_frame);

        while let Some((current, accumulated)) = queue.pop_front() {
            let Some(children) = self.edges.get(current) else {
                continue;
            };
            for (child, edge) in children {
                if !visited.insert(child.as_str()) {
                    continue;
                }
                let composed = accumulated.compose(edge);
                if child == source_frame {
                    return Some(composed);
                }
                queue.push_back((child.as_str(), composed));
            }
        }

        None
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mapfuse_types::Color;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn identity_is_noop() {
        let t = FrameTransform::identity("laser");
        let p = t.transform(&Point::new(1.0, -2.0, 3.0)).unwrap();
        assert_eq!((p.x, p.y, p.z), (1.0, -2.0, 3.0));
    }

    #[test]
    fn rotation_90_maps_x_to_y() {
        let t = FrameTransform::new("laser", 90.0, 0.0, 0.0);
        let p = t.transform(&Point::new(1.0, 0.0, 0.0)).unwrap();
        assert!(close(p.x, 0.0), "x={}", p.x);
        assert!(close(p.y, 1.0), "y={}", p.y);
    }

    #[test]
    fn z_and_color_pass_through() {
        let t = FrameTransform::new("stereo", 33.0, 4.0, -1.0);
        let red = Color::new(255, 0, 0);
        let p = t.transform(&Point::new(1.0, 2.0, 7.5).with_color(red)).unwrap();
        assert_eq!(p.z, 7.5);
        assert_eq!(p.color, Some(red));
    }

    #[test]
    fn non_finite_input_is_rejected() {
        let t = FrameTransform::identity("laser");
        let err = t.transform(&Point::new(f64::NAN, 0.0, 0.0)).unwrap_err();
        assert!(matches!(err, MapError::NonFiniteCoordinate { .. }));
        assert!(t.transform(&Point::new(0.0, f64::INFINITY, 0.0)).is_err());
    }

    #[test]
    fn inverse_round_trip() {
        let transforms = [
            FrameTransform::new("a", 0.0, 0.0, 0.0),
            FrameTransform::new("b", 37.5, 1.25, -3.0),
            FrameTransform::new("c", -120.0, -0.4, 9.0),
            FrameTransform::new("d", 180.0, 100.0, 0.001),
        ];
        let points = [
            Point::new(0.0, 0.0, 0.0),
            Point::new(1.0, 2.0, 3.0),
            Point::new(-7.5, 0.25, -1.0),
        ];
        for t in &transforms {
            let inv = t.inverse();
            for p in &points {
                let back = inv.transform(&t.transform(p).unwrap()).unwrap();
                assert!(close(back.x, p.x) && close(back.y, p.y) && close(back.z, p.z),
                    "{:?} via {:?} came back as {:?}", p, t, back);
            }
        }
    }

    #[test]
    fn compose_matches_sequential_application() {
        let outer = FrameTransform::new("base", 90.0, 1.0, 0.0);
        let inner = FrameTransform::new("laser", 0.0, 1.0, 0.0);
        let composed = outer.compose(&inner);
        let p = Point::new(0.5, 0.0, 0.0);
        let direct = outer.transform(&inner.transform(&p).unwrap()).unwrap();
        let via = composed.transform(&p).unwrap();
        assert!(close(direct.x, via.x) && close(direct.y, via.y));
        assert_eq!(composed.frame_id(), "laser");
        assert!(close(composed.rotation_deg(), 90.0));
    }

    #[test]
    fn lookup_same_frame_returns_identity() {
        let tree = FrameTree::new();
        let t = tree.lookup(COMMON_FRAME, COMMON_FRAME).unwrap();
        assert_eq!(t.translation(), (0.0, 0.0));
        assert_eq!(t.cos(), 1.0);
    }

    #[test]
    fn lookup_composes_chain_with_rotation() {
        // base is at the origin rotated 90°; laser sits 1 m along base +X.
        let mut tree = FrameTree::new();
        tree.set_transform(COMMON_FRAME, "base", FrameTransform::new("base", 90.0, 0.0, 0.0));
        tree.set_transform("base", "laser", FrameTransform::new("laser", 0.0, 1.0, 0.0));

        let t = tree.lookup(COMMON_FRAME, "laser").unwrap();
        let origin = t.transform(&Point::new(0.0, 0.0, 0.0)).unwrap();
        assert!(close(origin.x, 0.0), "x={}", origin.x);
        assert!(close(origin.y, 1.0), "y={}", origin.y);
    }

    #[test]
    fn lookup_is_directional() {
        let mut tree = FrameTree::new();
        tree.set_transform(COMMON_FRAME, "base", FrameTransform::new("base", 0.0, 1.0, 0.0));
        assert!(tree.lookup("base", COMMON_FRAME).is_none());
        assert!(tree.lookup(COMMON_FRAME, "ghost").is_none());
    }

    #[test]
    fn set_transform_overrides_previous() {
        let mut tree = FrameTree::new();
        tree.set_transform(COMMON_FRAME, "laser", FrameTransform::new("laser", 0.0, 1.0, 0.0));
        tree.set_transform(COMMON_FRAME, "laser", FrameTransform::new("laser", 0.0, 5.0, 0.0));
        let t = tree.lookup(COMMON_FRAME, "laser").unwrap();
        assert_eq!(t.translation(), (5.0, 0.0));
    }
}
