#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Tuning surface of the estimator.
pub mod config;

/// Error types for the estimator.
pub mod error;

/// The staged pose estimator.
pub mod estimator;

/// Camera, base, fixture and object frames.
pub mod frames;

/// Reportable object pose.
pub mod pose;

pub use config::PoseEstimatorConfig;
pub use error::PoseEstimatorError;
pub use estimator::{PoseEstimator, Stage};
pub use frames::{FixtureOffset, FrameChain, PoseFrame};
pub use pose::ObjectPose;
