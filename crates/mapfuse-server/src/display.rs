//! The display cloud: a handler's long-lived, reduction-maintained point set.
//!
//! Readers get an `Arc<PointCloud>` snapshot and never block writers for
//! longer than an `Arc` clone.  Merges copy-on-write through
//! [`Arc::make_mut`], so a snapshot handed out earlier is never mutated.
//!
//! A reduction pass takes a snapshot, runs the voxel filter with no lock
//! held, then commits `reduced ++ points merged meanwhile`.  Passes are
//! serialised by a separate gate so concurrent `reduce()` calls cannot lose
//! each other's tail.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use mapfuse_perception::reduce::{voxel_filter, LeafSize};
use mapfuse_types::{MapError, Point, PointCloud};
use tracing::debug;

#[derive(Debug)]
pub struct DisplayCloud {
    cloud: RwLock<Arc<PointCloud>>,
    reduce_gate: Mutex<()>,
    leaf: LeafSize,
}

impl DisplayCloud {
    /// Create an empty display cloud reduced with voxels of `leaf`.
    ///
    /// # Errors
    ///
    /// [`MapError::InvalidParameter`] when `leaf` is not positive and finite.
    pub fn new(leaf: LeafSize) -> Result<Self, MapError> {
        leaf.validate()?;
        Ok(Self {
            cloud: RwLock::new(Arc::new(PointCloud::new())),
            reduce_gate: Mutex::new(()),
            leaf,
        })
    }

    pub fn leaf(&self) -> LeafSize {
        self.leaf
    }

    /// Append already-transformed points and return how many were rejected.
    ///
    /// Points without a representable voxel cell for this cloud's leaf size
    /// (non-finite or too far out) are rejected, so a later reduction pass
    /// cannot fail on them.
    pub fn merge(&self, points: &[Point]) -> usize {
        let accepted: Vec<Point> = points
            .iter()
            .filter(|p| self.leaf.cell_of(p).is_some())
            .copied()
            .collect();
        let rejected = points.len() - accepted.len();
        if rejected > 0 {
            debug!(rejected, "points outside the voxel grid not merged");
        }
        if accepted.is_empty() {
            return rejected;
        }
        let mut guard = self.cloud.write().unwrap_or_else(PoisonError::into_inner);
        Arc::make_mut(&mut guard).extend_from_slice(&accepted);
        rejected
    }

    /// Consistent point-in-time view.
    pub fn snapshot(&self) -> Arc<PointCloud> {
        Arc::clone(&self.cloud.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one voxel pass and return the committed cloud.
    pub fn reduce(&self) -> Result<Arc<PointCloud>, MapError> {
        let _gate = self.reduce_gate.lock().unwrap_or_else(PoisonError::into_inner);

        let before = self.snapshot();
        let reduced = voxel_filter(&before, self.leaf)?;

        let mut guard = self.cloud.write().unwrap_or_else(PoisonError::into_inner);
        // Only merges ran since the snapshot, so the current cloud still
        // starts with the snapshot's points.
        let tail = guard.points().get(before.len()..).unwrap_or_default();
        let mut committed = PointCloud::with_capacity(reduced.len() + tail.len());
        committed.extend_from_slice(reduced.points());
        committed.extend_from_slice(tail);
        debug!(
            before = before.len(),
            reduced = reduced.len(),
            appended = tail.len(),
            "display cloud reduced"
        );

        let committed = Arc::new(committed);
        *guard = Arc::clone(&committed);
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize, y: f64) -> Vec<Point> {
        (0..n).map(|i| Point::new(i as f64 * 0.01, y, 0.0)).collect()
    }

    #[test]
    fn rejects_bad_leaf() {
        assert!(DisplayCloud::new(LeafSize::uniform(0.0)).is_err());
    }

    #[test]
    fn snapshot_is_not_mutated_by_later_merge() {
        let display = DisplayCloud::new(LeafSize::uniform(1.0)).unwrap();
        display.merge(&line(3, 0.0));
        let snap = display.snapshot();
        display.merge(&line(2, 5.0));
        assert_eq!(snap.len(), 3);
        assert_eq!(display.len(), 5);
    }

    #[test]
    fn far_points_are_rejected_and_reduction_keeps_working() {
        let display = DisplayCloud::new(LeafSize::uniform(0.05)).unwrap();
        let rejected = display.merge(&[Point::new(1e300, 0.0, 0.0), Point::new(1.0, 0.0, 0.0)]);
        assert_eq!(rejected, 1);
        display.merge(&line(10, 0.0));
        assert_eq!(display.len(), 11);
        assert!(display.reduce().is_ok());
    }

    #[test]
    fn reduce_never_grows() {
        let display = DisplayCloud::new(LeafSize::uniform(0.05)).unwrap();
        display.merge(&line(100, 0.5));
        let before = display.len();
        let after = display.reduce().unwrap();
        assert!(after.len() <= before);
        assert_eq!(display.len(), after.len());
    }

    #[test]
    fn concurrent_merges_survive_reduction() {
        let display = Arc::new(DisplayCloud::new(LeafSize::uniform(10.0)).unwrap());
        display.merge(&line(50, 1.0));

        std::thread::scope(|s| {
            let d = Arc::clone(&display);
            s.spawn(move || {
                for i in 0..20 {
                    d.merge(&[Point::new(100.0 + i as f64 * 20.0, 0.0, 0.0)]);
                }
            });
            for _ in 0..5 {
                display.reduce().unwrap();
            }
        });
        display.reduce().unwrap();

        // 50 points in one voxel plus 20 points in 20 distinct voxels.
        assert_eq!(display.len(), 21);
    }
}
