//! Pose Smoothing Filter.
//!
//! Smooths the noisy robot-position stream reported alongside sensor data
//! into a corrected estimate before it is written to a path history.
//!
//! [`PoseFilter`] is the seam handlers are built against; the default
//! implementation is [`KalmanPoseFilter`], a linear Kalman filter over a
//! constant-velocity model with one step per measurement:
//!
//! ```text
//! state  x = [px, py, vx, vy]ᵀ
//! F = | 1 0 1 0 |      H = | 1 0 0 0 |
//!     | 0 1 0 1 |          | 0 1 0 0 |
//!     | 0 0 1 0 |
//!     | 0 0 0 1 |
//! Q = q·I₄,  R = r·I₂
//! ```
//!
//! # Example
//!
//! ```rust
//! use mapfuse_perception::pose_filter::{KalmanPoseFilter, PoseFilter};
//! use mapfuse_types::Point;
//!
//! let mut filter = KalmanPoseFilter::default();
//! // The first measurement seeds the state and is returned unchanged.
//! let first = filter.update(Point::new(1.0, 2.0, 0.0)).unwrap();
//! assert_eq!((first.x, first.y), (1.0, 2.0));
//!
//! let next = filter.update(Point::new(1.2, 2.0, 0.0)).unwrap();
//! assert!(next.x > 1.0 && next.x < 1.2);
//! ```

use mapfuse_types::{MapError, Point};
use nalgebra::{Matrix2, Matrix2x4, Matrix4, Vector2, Vector4};

/// A recursive estimator turning raw position measurements into corrected
/// ones.
///
/// Implementations must be deterministic given the same measurement sequence.
pub trait PoseFilter: Send {
    /// Run one predict + correct cycle and return the corrected position.
    ///
    /// z and color of `measured` are carried through untouched.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::NonFiniteCoordinate`] for a NaN or infinite
    /// measurement, leaving the state untouched, and
    /// [`MapError::FilterDivergence`] when the estimate can no longer
    /// be trusted.  The filter is left uninitialised so the next call reseeds
    /// it from the raw measurement.
    fn update(&mut self, measured: Point) -> Result<Point, MapError>;

    /// Forget all state; the next measurement seeds the filter.
    fn reset(&mut self);

    fn is_initialized(&self) -> bool;
}

// ────────────────────────────────────────────────────────────────────────────
// KalmanConfig
// ────────────────────────────────────────────────────────────────────────────

/// Fixed noise configuration of a [`KalmanPoseFilter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KalmanConfig {
    /// Diagonal process noise `q`.
    pub process_noise: f64,
    /// Diagonal measurement noise `r` (variance of the raw position, m²).
    pub measurement_noise: f64,
    /// Diagonal of the covariance the state is seeded with.
    pub initial_covariance: f64,
    /// Covariance trace above which the filter is declared divergent.
    pub divergence_bound: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            process_noise: 1e-4,
            measurement_noise: 1e-1,
            initial_covariance: 1.0,
            divergence_bound: 1e6,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// KalmanPoseFilter
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct KalmanState {
    x: Vector4<f64>,
    p: Matrix4<f64>,
}

/// Constant-velocity Kalman filter over the planar robot position.
#[derive(Debug, Clone)]
pub struct KalmanPoseFilter {
    config: KalmanConfig,
    transition: Matrix4<f64>,
    observation: Matrix2x4<f64>,
    process: Matrix4<f64>,
    measurement: Matrix2<f64>,
    state: Option<KalmanState>,
}

impl KalmanPoseFilter {
    pub fn new(config: KalmanConfig) -> Self {
        #[rustfmt::skip]
        let transition = Matrix4::new(
            1.0, 0.0, 1.0, 0.0,
            0.0, 1.0, 0.0, 1.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        #[rustfmt::skip]
        let observation = Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        );
        Self {
            config,
            transition,
            observation,
            process: Matrix4::identity() * config.process_noise,
            measurement: Matrix2::identity() * config.measurement_noise,
            state: None,
        }
    }

    pub fn config(&self) -> &KalmanConfig {
        &self.config
    }

    /// Trace of the current error covariance, `None` before seeding.
    pub fn covariance_trace(&self) -> Option<f64> {
        self.state.as_ref().map(|s| s.p.trace())
    }
}

impl Default for KalmanPoseFilter {
    fn default() -> Self {
        Self::new(KalmanConfig::default())
    }
}

impl PoseFilter for KalmanPoseFilter {
    fn update(&mut self, measured: Point) -> Result<Point, MapError> {
        if !(measured.x.is_finite() && measured.y.is_finite()) {
            return Err(MapError::NonFiniteCoordinate {
                x: measured.x,
                y: measured.y,
                z: measured.z,
            });
        }
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => {
                self.state = Some(KalmanState {
                    x: Vector4::new(measured.x, measured.y, 0.0, 0.0),
                    p: Matrix4::identity() * self.config.initial_covariance,
                });
                return Ok(measured);
            }
        };

        // Predict.
        let x_pred = self.transition * state.x;
        let p_pred = self.transition * state.p * self.transition.transpose() + self.process;

        // Correct.
        let z = Vector2::new(measured.x, measured.y);
        let innovation = z - self.observation * x_pred;
        let s = self.observation * p_pred * self.observation.transpose() + self.measurement;
        let Some(s_inv) = s.try_inverse() else {
            let trace = p_pred.trace();
            self.state = None;
            return Err(MapError::FilterDivergence { trace });
        };
        let gain = p_pred * self.observation.transpose() * s_inv;
        let x_post = x_pred + gain * innovation;
        let p_post = (Matrix4::identity() - gain * self.observation) * p_pred;

        let trace = p_post.trace();
        if !trace.is_finite() || trace > self.config.divergence_bound || !x_post.iter().all(|v| v.is_finite()) {
            self.state = None;
            return Err(MapError::FilterDivergence { trace });
        }

        state.x = x_post;
        state.p = p_post;
        Ok(Point {
            x: x_post[0],
            y: x_post[1],
            ..measured
        })
    }

    fn reset(&mut self) {
        self.state = None;
    }

    fn is_initialized(&self) -> bool {
        self.state.is_some()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
