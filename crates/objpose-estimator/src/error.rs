use objpose_3d::{filters::CloudError, plane::PlaneError, transforms::TransformError};
use objpose_icp::RegistrationError;

use crate::estimator::Stage;

/// An error type for the pose estimator.
#[derive(Debug, thiserror::Error)]
pub enum PoseEstimatorError {
    /// The operation is not allowed in the current stage.
    #[error("{operation} is not allowed in stage {stage}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// Stage the estimator was in.
        stage: Stage,
    },

    /// A required input cloud was never set.
    #[error("no {0} cloud has been set")]
    MissingCloud(&'static str),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Cropping, downsampling or distortion removal failed.
    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// The support plane could not be estimated.
    #[error(transparent)]
    Plane(#[from] PlaneError),

    /// The registration failed.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// A frame transform could not be inverted.
    #[error(transparent)]
    Transform(#[from] TransformError),
}
