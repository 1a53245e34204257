/// Error types for the registration and the azimuth search.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// The source cloud has no points.
    #[error("source point cloud is empty")]
    EmptySource,

    /// The target cloud has no points.
    #[error("target point cloud is empty")]
    EmptyTarget,

    /// Too few correspondences survived the distance gates to estimate an update.
    #[error("registration needs at least {required} correspondences, got {actual}")]
    InsufficientCorrespondences {
        /// Minimum number of correspondences.
        required: usize,
        /// Correspondences left after rejection.
        actual: usize,
    },

    /// The iteration cap was reached before the update fell below the epsilon.
    #[error("registration did not converge after {iterations} iterations")]
    DidNotConverge {
        /// Iterations performed.
        iterations: usize,
    },

    /// A registration parameter is out of range.
    #[error("invalid registration parameter: {0}")]
    InvalidParameter(String),

    /// The azimuth range and step do not describe a sweep.
    #[error("invalid azimuth search range {range} with step {step}")]
    InvalidSearchRange {
        /// Full range of the sweep in radians.
        range: f64,
        /// Step between candidates in radians.
        step: f64,
    },
}
