//! `mapfuse-perception` – the numeric core of the ingestion pipeline.
//!
//! Turns noisy robot positions and raw sensor points into corrected,
//! common-frame geometry, and keeps accumulated clouds small.
//!
//! # Modules
//!
//! - [`transform`] – [`FrameTransform`][transform::FrameTransform] and
//!   [`FrameTree`][transform::FrameTree]: planar rigid transforms between
//!   named frames and the chain lookup composing them.
//! - [`pose_filter`] – [`PoseFilter`][pose_filter::PoseFilter] trait and the
//!   default constant-velocity
//!   [`KalmanPoseFilter`][pose_filter::KalmanPoseFilter].
//! - [`octree`] – [`Octree`][octree::Octree]: spatial index answering the
//!   k-nearest-neighbour queries of the outlier filter.
//! - [`reduce`] – voxel-grid downsampling, statistical outlier removal and
//!   region density estimation.

pub mod octree;
pub mod pose_filter;
pub mod reduce;
pub mod transform;
