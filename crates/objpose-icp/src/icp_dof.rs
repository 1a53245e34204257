use faer::{prelude::SpSolver, Mat};
use glam::DVec3;
use objpose_3d::{pointcloud::PointCloud, transforms::Transform};

use crate::correspondence::{
    find_correspondences, mean_squared_distance, reject_outliers, Correspondence, KdTree,
};
use crate::dof::{DofMask, PoseDelta};
use crate::error::RegistrationError;

/// Minimum number of correspondences to estimate an update.
pub const MIN_CORRESPONDENCES: usize = 3;

/// Structure to define the registration parameters.
#[derive(Debug, Clone)]
pub struct RegistrationParams {
    /// Parameters the registration may change.
    pub dof_mask: DofMask,
    /// Maximum number of iterations to perform.
    pub max_iterations: usize,
    /// Pairs farther apart than this are ignored, in meters.
    pub max_correspondence_distance: f64,
    /// Pairs farther apart than this do not take part in the update, in meters.
    pub outlier_rejection_threshold: f64,
    /// Keep only mutual nearest neighbors.
    pub use_reciprocal_correspondences: bool,
    /// The registration converged when the update norm falls below this value.
    pub transformation_epsilon: f64,
    /// Relative damping added to the diagonal of the normal equations.
    pub damping: f64,
    /// Rotations of the source about its vertical axis under which it looks the same.
    ///
    /// Each one is tried as an alternative start and the best fit is kept.
    pub symmetries: Vec<Transform>,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            dof_mask: DofMask::Free,
            max_iterations: 100,
            max_correspondence_distance: 0.05,
            outlier_rejection_threshold: 0.01,
            use_reciprocal_correspondences: false,
            transformation_epsilon: 1e-8,
            damping: 1e-9,
            symmetries: Vec::new(),
        }
    }
}

impl RegistrationParams {
    fn validate(&self) -> Result<(), RegistrationError> {
        if !(self.max_correspondence_distance > 0.0) {
            return Err(RegistrationError::InvalidParameter(format!(
                "max_correspondence_distance must be > 0, got {}",
                self.max_correspondence_distance
            )));
        }
        if !(self.outlier_rejection_threshold > 0.0) {
            return Err(RegistrationError::InvalidParameter(format!(
                "outlier_rejection_threshold must be > 0, got {}",
                self.outlier_rejection_threshold
            )));
        }
        if !(self.transformation_epsilon >= 0.0) || !(self.damping >= 0.0) {
            return Err(RegistrationError::InvalidParameter(
                "transformation_epsilon and damping must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rotations about the vertical axis of an object with `order`-fold symmetry.
///
/// Returns the `order - 1` non-trivial rotations; an order of 0 or 1 gives none.
pub fn rotational_symmetries(order: usize) -> Vec<Transform> {
    (1..order.max(1))
        .map(|k| Transform::from_rotation_z(std::f64::consts::TAU * k as f64 / order as f64))
        .collect()
}

/// Result of the registration.
///
/// The transformation is from the source to the target frame.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    /// Estimated transform, initial guess included.
    pub transform: Transform,
    /// Mean squared distance of the final correspondences.
    pub fitness: f64,
    /// The total number of iterations performed.
    pub num_iterations: usize,
    /// Whether the update fell below the epsilon before the iteration cap.
    pub converged: bool,
    /// Correspondences at the final transform.
    pub correspondences: Vec<Correspondence>,
}

impl RegistrationResult {
    /// Turn a result that hit the iteration cap into an error.
    pub fn ensure_converged(self) -> Result<Self, RegistrationError> {
        if self.converged {
            Ok(self)
        } else {
            Err(RegistrationError::DidNotConverge {
                iterations: self.num_iterations,
            })
        }
    }
}

/// Point-to-point ICP restricted to a subset of the rigid-body parameters.
///
/// The target search tree is built once, so the registrar can be shared across many
/// registrations of different sources or initial guesses.
pub struct DofIcp<'a> {
    target: &'a PointCloud,
    kdtree: KdTree,
    params: RegistrationParams,
}

impl<'a> DofIcp<'a> {
    /// Build the registrar for `target`.
    pub fn new(target: &'a PointCloud, params: RegistrationParams) -> Result<Self, RegistrationError> {
        params.validate()?;
        if target.is_empty() {
            return Err(RegistrationError::EmptyTarget);
        }
        let kdtree = KdTree::new_from_slice(target.points());
        Ok(Self {
            target,
            kdtree,
            params,
        })
    }

    /// The registration parameters.
    pub fn params(&self) -> &RegistrationParams {
        &self.params
    }

    /// The target cloud.
    pub fn target(&self) -> &PointCloud {
        self.target
    }

    /// Register `source` starting from `initial`, ignoring the symmetries.
    ///
    /// Each iteration pairs the moved source with the target, linearizes the rotation
    /// about the centroid of the paired source points and solves the Gauss-Newton normal
    /// equations over the free parameters only.
    pub fn register(
        &self,
        source: &PointCloud,
        initial: &Transform,
    ) -> Result<RegistrationResult, RegistrationError> {
        if source.is_empty() {
            return Err(RegistrationError::EmptySource);
        }
        let params = &self.params;

        let mut transform = *initial;
        let mut current_source = vec![[0.0; 3]; source.len()];
        transform.transform_points(source.points(), &mut current_source);
        let mut transformed_points = vec![[0.0; 3]; source.len()];

        let mut num_iterations = 0;
        let mut converged = false;

        // main icp loop
        for i in 0..params.max_iterations {
            let source_tree = params
                .use_reciprocal_correspondences
                .then(|| KdTree::new_from_slice(&current_source));
            let correspondences = find_correspondences(
                &current_source,
                self.target.points(),
                &self.kdtree,
                params.max_correspondence_distance,
                source_tree.as_ref(),
            );
            let inliers = reject_outliers(
                &correspondences,
                params.outlier_rejection_threshold,
                MIN_CORRESPONDENCES,
            );
            if inliers.len() < MIN_CORRESPONDENCES {
                return Err(RegistrationError::InsufficientCorrespondences {
                    required: MIN_CORRESPONDENCES,
                    actual: inliers.len(),
                });
            }

            let Some(delta) = solve_update(
                &current_source,
                self.target.points(),
                &inliers,
                params.dof_mask,
                params.damping,
            ) else {
                log::warn!("degenerate normal equations at iteration {i}, stopping");
                break;
            };

            let step = delta.to_transform();
            step.transform_points(&current_source, &mut transformed_points);
            std::mem::swap(&mut current_source, &mut transformed_points);
            transform = step.compose(&transform);
            num_iterations += 1;

            log::trace!(
                "iteration {i}: {} pairs, mse {:.3e}, step {:.3e}",
                inliers.len(),
                mean_squared_distance(&inliers),
                delta.magnitude()
            );

            if delta.magnitude() < params.transformation_epsilon {
                converged = true;
                break;
            }
        }

        let correspondences = find_correspondences(
            &current_source,
            self.target.points(),
            &self.kdtree,
            params.max_correspondence_distance,
            None,
        );
        let fitness = mean_squared_distance(&correspondences);

        log::debug!(
            "registration finished after {num_iterations} iterations, converged: {converged}, fitness {fitness:.3e}"
        );

        Ok(RegistrationResult {
            transform,
            fitness,
            num_iterations,
            converged,
            correspondences,
        })
    }

    /// Register `source` from `initial` and from every symmetric variant of it.
    ///
    /// The variants rotate the source about the vertical axis through its centroid
    /// before `initial` is applied. The lowest fitness wins, ties going to the plain start.
    pub fn register_with_symmetries(
        &self,
        source: &PointCloud,
        initial: &Transform,
    ) -> Result<RegistrationResult, RegistrationError> {
        let mut best = self.register(source, initial)?;
        if self.params.symmetries.is_empty() {
            return Ok(best);
        }
        let centroid = source.centroid().ok_or(RegistrationError::EmptySource)?;
        let to_centroid = Transform::from_translation(centroid);
        let from_centroid = Transform::from_translation(-centroid);

        for (k, symmetry) in self.params.symmetries.iter().enumerate() {
            let start = *initial * to_centroid * *symmetry * from_centroid;
            let candidate = match self.register(source, &start) {
                Ok(candidate) => candidate,
                Err(err) => {
                    log::debug!("symmetry hypothesis {k} failed: {err}");
                    continue;
                }
            };
            if candidate.fitness < best.fitness {
                log::debug!(
                    "symmetry hypothesis {k} improves fitness {:.3e} -> {:.3e}",
                    best.fitness,
                    candidate.fitness
                );
                best = candidate;
            }
        }
        Ok(best)
    }
}

/// Register `source` onto `target` with the given parameters, symmetries included.
///
/// # Arguments
///
/// * `source` - Source point cloud.
/// * `target` - Target point cloud.
/// * `initial` - Initial transform from the source to the target frame.
/// * `params` - Registration parameters.
pub fn register(
    source: &PointCloud,
    target: &PointCloud,
    initial: &Transform,
    params: &RegistrationParams,
) -> Result<RegistrationResult, RegistrationError> {
    DofIcp::new(target, params.clone())?.register_with_symmetries(source, initial)
}

// Gauss-Newton step for the point-to-point residual e = p - q, with the rotation
// linearized as p + w x (p - c) about the centroid c of the paired source points.
fn solve_update(
    source: &[[f64; 3]],
    target: &[[f64; 3]],
    correspondences: &[Correspondence],
    mask: DofMask,
    damping: f64,
) -> Option<PoseDelta> {
    let pivot = correspondences
        .iter()
        .fold(DVec3::ZERO, |acc, c| acc + DVec3::from_array(source[c.source]))
        / correspondences.len() as f64;

    let mut hessian = [[0.0; 6]; 6];
    let mut gradient = [0.0; 6];
    for c in correspondences {
        let p = DVec3::from_array(source[c.source]);
        let e = p - DVec3::from_array(target[c.target]);
        let r = p - pivot;
        let rows = [
            [1.0, 0.0, 0.0, 0.0, r.z, -r.y],
            [0.0, 1.0, 0.0, -r.z, 0.0, r.x],
            [0.0, 0.0, 1.0, r.y, -r.x, 0.0],
        ];
        for (row, e_k) in rows.iter().zip(e.to_array()) {
            for a in 0..6 {
                gradient[a] += row[a] * e_k;
                for b in 0..6 {
                    hessian[a][b] += row[a] * row[b];
                }
            }
        }
    }

    let free = mask.free_indices();
    let n = free.len();
    let lhs = Mat::<f64>::from_fn(n, n, |i, j| {
        let h = hessian[free[i]][free[j]];
        if i == j {
            h * (1.0 + damping) + damping
        } else {
            h
        }
    });
    let rhs = Mat::<f64>::from_fn(n, 1, |i, _| -gradient[free[i]]);
    let solution = lhs.partial_piv_lu().solve(rhs);

    let mut params = [0.0; 6];
    for (i, &dof) in free.iter().enumerate() {
        let value = solution.read(i, 0);
        if !value.is_finite() {
            return None;
        }
        params[dof] = value;
    }
    mask.project(&mut params);
    Some(PoseDelta { params, pivot })
}
