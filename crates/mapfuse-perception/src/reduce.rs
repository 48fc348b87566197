//! Spatial Reducers.
//!
//! Pure functions that shrink or summarise a [`PointCloud`]:
//!
//! | Function | Effect |
//! |----------|--------|
//! | [`voxel_filter`]        | One centroid per occupied grid cell.                    |
//! | [`stats_filter`]        | Drops points far from their k nearest neighbours.       |
//! | [`calc_region_density`] | Fraction of a box's sub-cells holding at least a point. |
//!
//! The voxel grid is anchored at the origin (cell `i` spans
//! `[i·leaf, (i+1)·leaf)` on each axis), so a centroid always lands in the
//! cell it came from and filtering twice with the same leaf size changes
//! nothing.
//!
//! Non-finite points never survive a reducer.
//!
//! # Example
//!
//! ```rust
//! use mapfuse_perception::reduce::{voxel_filter, LeafSize};
//! use mapfuse_types::{Point, PointCloud};
//!
//! let cloud: PointCloud = vec![
//!     Point::new(0.1, 0.1, 0.0),
//!     Point::new(0.3, 0.1, 0.0),
//!     Point::new(5.0, 5.0, 0.0),
//! ]
//! .into();
//! let reduced = voxel_filter(&cloud, LeafSize::uniform(1.0)).unwrap();
//! assert_eq!(reduced.len(), 2);
//! assert!((reduced.points()[0].x - 0.2).abs() < 1e-9);
//! ```

use std::collections::{BTreeMap, HashSet};

use mapfuse_types::{Color, MapError, Point, PointCloud};
use tracing::debug;

use crate::octree::Octree;

/// Leaf capacity of the neighbour index built by [`stats_filter_with`].
const NEIGHBOUR_INDEX_CAPACITY: usize = 16;

// ────────────────────────────────────────────────────────────────────────────
// LeafSize
// ────────────────────────────────────────────────────────────────────────────

/// Voxel edge lengths per axis, in metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafSize {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl LeafSize {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Cubic voxels.
    pub const fn uniform(edge: f64) -> Self {
        Self::new(edge, edge, edge)
    }

    /// Every edge must be finite and strictly positive.
    pub fn validate(&self) -> Result<(), MapError> {
        for (axis, v) in [("x", self.x), ("y", self.y), ("z", self.z)] {
            if !v.is_finite() || v <= 0.0 {
                return Err(MapError::InvalidParameter(format!(
                    "voxel leaf size along {axis} must be positive and finite, got {v}"
                )));
            }
        }
        Ok(())
    }

    /// Grid cell holding `p`, or `None` when `p` is not finite or its index
    /// along some axis does not fit in 64 bits.
    pub fn cell_of(&self, p: &Point) -> Option<(i64, i64, i64)> {
        if !p.is_finite() {
            return None;
        }
        Some((
            cell_index(p.x, self.x)?,
            cell_index(p.y, self.y)?,
            cell_index(p.z, self.z)?,
        ))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Voxel filter
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CellAccumulator {
    sum: [f64; 3],
    count: usize,
    rgb: [u64; 3],
    colored: u64,
}

impl CellAccumulator {
    fn add(&mut self, p: &Point) {
        self.sum[0] += p.x;
        self.sum[1] += p.y;
        self.sum[2] += p.z;
        self.count += 1;
        if let Some(c) = p.color {
            self.rgb[0] += u64::from(c.r);
            self.rgb[1] += u64::from(c.g);
            self.rgb[2] += u64::from(c.b);
            self.colored += 1;
        }
    }

    fn centroid(&self) -> Point {
        let n = self.count as f64;
        let color = (self.colored > 0).then(|| {
            let avg = |sum: u64| ((sum + self.colored / 2) / self.colored) as u8;
            Color::new(avg(self.rgb[0]), avg(self.rgb[1]), avg(self.rgb[2]))
        });
        Point {
            x: self.sum[0] / n,
            y: self.sum[1] / n,
            z: self.sum[2] / n,
            color,
        }
    }
}

fn cell_index(v: f64, leaf: f64) -> Option<i64> {
    let cell = (v / leaf).floor();
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
    (cell >= i64::MIN as f64 && cell < i64::MAX as f64).then_some(cell as i64)
}

/// Replace every occupied voxel of `cloud` with the centroid of its points.
///
/// The centroid carries the per-channel average color of the cell's colored
/// points, or no color when none of them had one.  Output is ordered by cell
/// index, so the result is deterministic for a given input.
///
/// # Errors
///
/// [`MapError::InvalidParameter`] when `leaf` is not positive and finite or a
/// point's cell index does not fit in 64 bits; `cloud` is never modified.
pub fn voxel_filter(cloud: &PointCloud, leaf: LeafSize) -> Result<PointCloud, MapError> {
    leaf.validate()?;

    let mut cells: BTreeMap<(i64, i64, i64), CellAccumulator> = BTreeMap::new();
    let mut skipped = 0usize;
    for p in cloud {
        if !p.is_finite() {
            skipped += 1;
            continue;
        }
        let Some(key) = leaf.cell_of(p) else {
            return Err(MapError::InvalidParameter(format!(
                "leaf size {leaf:?} too small for point ({}, {}, {})",
                p.x, p.y, p.z
            )));
        };
        cells.entry(key).or_default().add(p);
    }

    if skipped > 0 {
        debug!(skipped, "voxel filter dropped non-finite points");
    }

    Ok(cells.values().map(CellAccumulator::centroid).collect())
}

// ────────────────────────────────────────────────────────────────────────────
// Statistical outlier filter
// ────────────────────────────────────────────────────────────────────────────

/// [`stats_filter_with`] using a standard-deviation multiplier of `1.0`.
pub fn stats_filter(cloud: &PointCloud, k: usize) -> Result<PointCloud, MapError> {
    stats_filter_with(cloud, k, 1.0)
}

/// Statistical outlier removal.
///
/// For every finite point, the mean distance to its `k` nearest neighbours
/// (itself excluded) is computed.  Points whose mean distance exceeds
/// `mean + std_mul · stddev` over the whole cloud are discarded; the rest are
/// returned in input order.  The standard deviation is the sample one.
///
/// # Errors
///
/// [`MapError::InvalidParameter`] when `k == 0`, when `k` is not smaller than
/// the number of finite points, or when `std_mul` is not finite.
pub fn stats_filter_with(cloud: &PointCloud, k: usize, std_mul: f64) -> Result<PointCloud, MapError> {
    if !std_mul.is_finite() {
        return Err(MapError::InvalidParameter(format!(
            "stddev multiplier must be finite, got {std_mul}"
        )));
    }
    let finite: Vec<Point> = cloud.iter().filter(|p| p.is_finite()).copied().collect();
    if k == 0 || k >= finite.len() {
        return Err(MapError::InvalidParameter(format!(
            "stats filter needs 0 < k < point count, got k={k} for {} points",
            finite.len()
        )));
    }

    let Some(index) = Octree::from_points(&finite, NEIGHBOUR_INDEX_CAPACITY) else {
        return Err(MapError::InvalidParameter("stats filter input has no finite points".to_string()));
    };

    let mean_dists: Vec<f64> = finite
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let nearest = index.k_nearest(p, k, Some(i));
            nearest.iter().map(|(_, d_sq)| d_sq.sqrt()).sum::<f64>() / nearest.len() as f64
        })
        .collect();

    let n = mean_dists.len() as f64;
    let mean = mean_dists.iter().sum::<f64>() / n;
    let variance = mean_dists.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let threshold = mean + std_mul * variance.sqrt();

    let kept: PointCloud = finite
        .iter()
        .zip(&mean_dists)
        .filter(|(_, d)| **d <= threshold)
        .map(|(p, _)| *p)
        .collect();

    debug!(
        input = cloud.len(),
        kept = kept.len(),
        threshold,
        "stats filter pass"
    );
    Ok(kept)
}

// ────────────────────────────────────────────────────────────────────────────
// Region density
// ────────────────────────────────────────────────────────────────────────────

/// Occupancy breakdown of a box split into `divisor³` equal sub-cells.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionDensity {
    /// Finite points inside the box (boundary inclusive).
    pub points_inside: usize,
    /// Sub-cells holding at least one point.
    pub occupied_cells: usize,
    pub total_cells: usize,
    /// Volume of one sub-cell in m³.
    pub cell_volume: f64,
}

impl RegionDensity {
    /// Occupied fraction of the sub-cells, in `[0, 1]`.
    pub fn coverage(&self) -> f64 {
        self.occupied_cells as f64 / self.total_cells as f64
    }

    /// Points per m³ of occupied space; `0.0` when nothing is occupied.
    pub fn density(&self) -> f64 {
        if self.occupied_cells == 0 {
            return 0.0;
        }
        self.points_inside as f64 / (self.occupied_cells as f64 * self.cell_volume)
    }
}

/// Fraction of the `divisor³` sub-cells of the box `[min, max]` that contain
/// at least one point of `cloud`.
pub fn calc_region_density(cloud: &PointCloud, min: Point, max: Point, divisor: usize) -> Result<f64, MapError> {
    region_density(cloud, min, max, divisor).map(|r| r.coverage())
}

/// Full occupancy breakdown behind [`calc_region_density`].
///
/// Points on the upper face of the box fall into the last sub-cell.
///
/// # Errors
///
/// [`MapError::InvalidParameter`] when `divisor` is zero, its cube overflows,
/// or the box is empty or non-finite along any axis.
pub fn region_density(cloud: &PointCloud, min: Point, max: Point, divisor: usize) -> Result<RegionDensity, MapError> {
    let total_cells = divisor
        .checked_mul(divisor)
        .and_then(|sq| sq.checked_mul(divisor))
        .filter(|&total| total > 0)
        .ok_or_else(|| MapError::InvalidParameter(format!("invalid region divisor {divisor}")))?;
    if !min.is_finite() || !max.is_finite() || min.x >= max.x || min.y >= max.y || min.z >= max.z {
        return Err(MapError::InvalidParameter(format!(
            "region min ({}, {}, {}) must be below max ({}, {}, {}) on every axis",
            min.x, min.y, min.z, max.x, max.y, max.z
        )));
    }

    let extent = [max.x - min.x, max.y - min.y, max.z - min.z];
    let d = divisor as f64;
    let sub = |v: f64, lo: f64, span: f64| (((v - lo) / span * d) as usize).min(divisor - 1);

    let mut occupied: HashSet<(usize, usize, usize)> = HashSet::new();
    let mut points_inside = 0usize;
    for p in cloud {
        let inside = p.is_finite()
            && (min.x..=max.x).contains(&p.x)
            && (min.y..=max.y).contains(&p.y)
            && (min.z..=max.z).contains(&p.z);
        if !inside {
            continue;
        }
        points_inside += 1;
        occupied.insert((
            sub(p.x, min.x, extent[0]),
            sub(p.y, min.y, extent[1]),
            sub(p.z, min.z, extent[2]),
        ));
    }

    Ok(RegionDensity {
        points_inside,
        occupied_cells: occupied.len(),
        total_cells,
        cell_volume: extent.iter().map(|e| e / d).product(),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize, spacing: f64) -> Vec<Point> {
        let mut pts = Vec::new();
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    pts.push(Point::new(i as f64 * spacing, j as f64 * spacing, k as f64 * spacing));
                }
            }
        }
        pts
    }

    fn cube() -> (Point, Point) {
        (Point::new(0.0, 0.0, 0.0), Point::new(1.0, 1.0, 1.0))
    }

    // ── voxel_filter ────────────────────────────────────────────────────────

    #[test]
    fn voxel_rejects_bad_leaf() {
        let cloud: PointCloud = vec![Point::new(0.0, 0.0, 0.0)].into();
        for leaf in [
            LeafSize::uniform(0.0),
            LeafSize::uniform(-1.0),
            LeafSize::new(1.0, f64::NAN, 1.0),
            LeafSize::new(1.0, 1.0, f64::INFINITY),
        ] {
            assert!(matches!(
                voxel_filter(&cloud, leaf),
                Err(MapError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn voxel_reports_index_overflow() {
        let cloud: PointCloud = vec![Point::new(1e300, 0.0, 0.0)].into();
        let err = voxel_filter(&cloud, LeafSize::uniform(1e-10)).unwrap_err();
        assert!(matches!(err, MapError::InvalidParameter(_)));
    }

    #[test]
    fn cell_of_rejects_unrepresentable_points() {
        let leaf = LeafSize::uniform(0.05);
        assert_eq!(leaf.cell_of(&Point::new(0.12, -0.01, 0.0)), Some((2, -1, 0)));
        assert_eq!(leaf.cell_of(&Point::new(1e300, 0.0, 0.0)), None);
        assert_eq!(leaf.cell_of(&Point::new(0.0, f64::NAN, 0.0)), None);
    }

    #[test]
    fn voxel_never_grows_and_is_idempotent() {
        let mut pts = grid(6, 0.37);
        pts.push(Point::new(-3.3, 7.1, 0.02));
        let cloud: PointCloud = pts.into();
        let leaf = LeafSize::new(0.5, 0.8, 1.1);

        let once = voxel_filter(&cloud, leaf).unwrap();
        assert!(once.len() <= cloud.len());
        let twice = voxel_filter(&once, leaf).unwrap();
        assert_eq!(twice.len(), once.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert!(a.distance(b) < 1e-9, "{a:?} moved to {b:?}");
        }
    }

    #[test]
    fn merged_batches_collapse_to_one_centroid() {
        // 100 points then 50 more, all within [1, 2) on each axis.
        let mut cloud = PointCloud::new();
        for i in 0..100 {
            let f = i as f64 / 100.0;
            cloud.push(Point::new(1.0 + f * 0.9, 1.5, 1.0 + f * 0.5));
        }
        let batch: Vec<Point> = (0..50).map(|i| Point::new(1.25, 1.0 + i as f64 / 60.0, 1.75)).collect();
        cloud.extend_from_slice(&batch);
        assert_eq!(cloud.len(), 150);

        let reduced = voxel_filter(&cloud, LeafSize::uniform(100.0)).unwrap();
        assert_eq!(reduced.len(), 1);

        let n = cloud.len() as f64;
        let cx = cloud.iter().map(|p| p.x).sum::<f64>() / n;
        let cy = cloud.iter().map(|p| p.y).sum::<f64>() / n;
        let cz = cloud.iter().map(|p| p.z).sum::<f64>() / n;
        let c = reduced.points()[0];
        assert!((c.x - cx).abs() < 1e-9 && (c.y - cy).abs() < 1e-9 && (c.z - cz).abs() < 1e-9);
    }

    #[test]
    fn voxel_averages_colors_of_colored_points() {
        let cloud: PointCloud = vec![
            Point::new(0.1, 0.1, 0.1).with_color(Color::new(200, 0, 10)),
            Point::new(0.2, 0.1, 0.1).with_color(Color::new(100, 50, 11)),
            Point::new(0.3, 0.1, 0.1),
            Point::new(3.0, 0.1, 0.1),
        ]
        .into();
        let reduced = voxel_filter(&cloud, LeafSize::uniform(1.0)).unwrap();
        assert_eq!(reduced.len(), 2);
        assert_eq!(reduced.points()[0].color, Some(Color::new(150, 25, 11)));
        assert_eq!(reduced.points()[1].color, None);
    }

    #[test]
    fn voxel_drops_non_finite_and_orders_by_cell() {
        let cloud: PointCloud = vec![
            Point::new(5.5, 0.0, 0.0),
            Point::new(f64::NAN, 0.0, 0.0),
            Point::new(-2.5, 0.0, 0.0),
            Point::new(0.5, 0.0, 0.0),
        ]
        .into();
        let reduced = voxel_filter(&cloud, LeafSize::uniform(1.0)).unwrap();
        let xs: Vec<f64> = reduced.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![-2.5, 0.5, 5.5]);
    }

    #[test]
    fn voxel_on_empty_cloud_is_empty() {
        let reduced = voxel_filter(&PointCloud::new(), LeafSize::uniform(0.1)).unwrap();
        assert!(reduced.is_empty());
    }

    // ── stats_filter ────────────────────────────────────────────────────────

    #[test]
    fn stats_removes_isolated_outlier() {
        let mut pts = grid(3, 0.1);
        pts.push(Point::new(10.0, 10.0, 10.0));
        let cloud: PointCloud = pts.into();

        let kept = stats_filter(&cloud, 4).unwrap();
        assert_eq!(kept.len(), 27);
        assert!(kept.iter().all(|p| p.x < 1.0));
    }

    #[test]
    fn stats_rejects_k_not_below_population() {
        let cloud: PointCloud = grid(2, 1.0).into();
        let before = cloud.clone();
        for k in [0, 8, 9, 100] {
            let err = stats_filter(&cloud, k).unwrap_err();
            assert!(matches!(err, MapError::InvalidParameter(_)), "k={k}");
        }
        assert_eq!(cloud, before);
    }

    #[test]
    fn stats_never_grows_and_keeps_order() {
        let cloud: PointCloud = grid(4, 0.25).into();
        let kept = stats_filter_with(&cloud, 3, 0.5).unwrap();
        assert!(kept.len() <= cloud.len());

        let positions: Vec<usize> = kept
            .iter()
            .map(|p| cloud.iter().position(|q| q == p).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn stats_rejects_non_finite_multiplier() {
        let cloud: PointCloud = grid(2, 1.0).into();
        assert!(stats_filter_with(&cloud, 2, f64::NAN).is_err());
    }

    #[test]
    fn stats_drops_non_finite_points() {
        let mut pts = grid(2, 1.0);
        pts.push(Point::new(f64::INFINITY, 0.0, 0.0));
        let kept = stats_filter(&pts.into(), 2).unwrap();
        assert!(kept.iter().all(Point::is_finite));
    }

    // ── region density ──────────────────────────────────────────────────────

    #[test]
    fn density_counts_occupied_fraction() {
        let (min, max) = cube();
        let cloud: PointCloud = vec![
            Point::new(0.1, 0.1, 0.1),
            Point::new(0.2, 0.2, 0.2),
            Point::new(0.9, 0.9, 0.9),
            Point::new(5.0, 5.0, 5.0),
        ]
        .into();
        let r = region_density(&cloud, min, max, 2).unwrap();
        assert_eq!(r.points_inside, 3);
        assert_eq!(r.occupied_cells, 2);
        assert_eq!(r.total_cells, 8);
        assert!((r.cell_volume - 0.125).abs() < 1e-12);
        assert!((r.coverage() - 0.25).abs() < 1e-12);
        assert!((r.density() - 12.0).abs() < 1e-9);
        assert!((calc_region_density(&cloud, min, max, 2).unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn density_upper_face_lands_in_last_cell() {
        let (min, max) = cube();
        let cloud: PointCloud = vec![Point::new(1.0, 1.0, 1.0)].into();
        let r = region_density(&cloud, min, max, 4).unwrap();
        assert_eq!(r.points_inside, 1);
        assert_eq!(r.occupied_cells, 1);
    }

    #[test]
    fn density_rejects_bad_region() {
        let (min, max) = cube();
        let cloud = PointCloud::new();
        assert!(region_density(&cloud, min, max, 0).is_err());
        assert!(region_density(&cloud, max, min, 2).is_err());
        let flat = Point::new(1.0, 0.0, 1.0);
        assert!(region_density(&cloud, min, flat, 2).is_err());
    }

    #[test]
    fn density_of_empty_region_is_zero() {
        let (min, max) = cube();
        let r = region_density(&PointCloud::new(), min, max, 3).unwrap();
        assert_eq!(r.coverage(), 0.0);
        assert_eq!(r.density(), 0.0);
    }
}
