//! Sweep of the registration over initial rotations about the vertical axis.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use objpose_3d::{pointcloud::PointCloud, transforms::Transform};
use rayon::prelude::*;

use crate::error::RegistrationError;
use crate::icp_dof::{DofIcp, RegistrationResult};

/// Parameters of the azimuth sweep.
#[derive(Debug, Clone)]
pub struct AzimuthSearchParams {
    /// Full width of the sweep in radians, centered on the initial guess.
    pub range: f64,
    /// Angle between two candidates in radians.
    pub step: f64,
    /// Stop scheduling new candidates once a trial reaches this fitness.
    pub target_fitness: Option<f64>,
}

impl Default for AzimuthSearchParams {
    fn default() -> Self {
        Self {
            range: std::f64::consts::PI,
            step: 5f64.to_radians(),
            target_fitness: None,
        }
    }
}

/// Outcome of one candidate of the sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AzimuthTrial {
    /// Offset from the initial azimuth, in radians.
    pub azimuth: f64,
    /// Fitness reached from this candidate.
    pub fitness: f64,
    /// Whether the registration converged.
    pub converged: bool,
}

/// Best registration found by the sweep.
#[derive(Debug, Clone)]
pub struct AzimuthSearchResult {
    /// The winning registration.
    pub result: RegistrationResult,
    /// Azimuth offset of the winning candidate, in radians.
    pub azimuth: f64,
    /// Every trial that ran, in candidate order.
    pub trials: Vec<AzimuthTrial>,
}

/// Candidate azimuth offsets from `-range / 2` to `range / 2`, both bounds included.
///
/// A zero range gives the single candidate 0. When `range` is not a multiple of `step`,
/// the upper bound is appended after the last full step.
pub fn azimuth_candidates(range: f64, step: f64) -> Result<Vec<f64>, RegistrationError> {
    if !(step > 0.0) || !(range >= 0.0) || !range.is_finite() || !step.is_finite() {
        return Err(RegistrationError::InvalidSearchRange { range, step });
    }
    if range == 0.0 {
        return Ok(vec![0.0]);
    }
    let num_steps = (range / step + 1e-9).floor() as usize;
    let start = -0.5 * range;
    let mut candidates = (0..=num_steps)
        .map(|k| start + k as f64 * step)
        .collect::<Vec<_>>();
    if let Some(&last) = candidates.last() {
        if 0.5 * range - last > 1e-9 {
            candidates.push(0.5 * range);
        }
    }
    Ok(candidates)
}

// Lower fitness first, NaN last, then the smaller offset, then candidate order.
fn compare_trials(a: (usize, &AzimuthTrial), b: (usize, &AzimuthTrial)) -> Ordering {
    let key = |f: f64| if f.is_nan() { f64::INFINITY } else { f };
    key(a.1.fitness)
        .total_cmp(&key(b.1.fitness))
        .then(a.1.azimuth.abs().total_cmp(&b.1.azimuth.abs()))
        .then(a.0.cmp(&b.0))
}

/// Run the registration from every azimuth candidate and keep the best one.
///
/// Each candidate rotates `initial` about the vertical axis through the centroid of the
/// placed source. Trials run in parallel; the winner does not depend on the scheduling.
/// Candidates whose registration fails are skipped, and the first failure is returned
/// when none succeeds.
///
/// # Arguments
///
/// * `icp` - Registrar holding the target and the registration parameters.
/// * `source` - Source point cloud.
/// * `initial` - Initial transform from the source to the target frame.
/// * `params` - Sweep parameters.
pub fn search_azimuth(
    icp: &DofIcp<'_>,
    source: &PointCloud,
    initial: &Transform,
    params: &AzimuthSearchParams,
) -> Result<AzimuthSearchResult, RegistrationError> {
    let candidates = azimuth_candidates(params.range, params.step)?;
    let pivot = source
        .transformed(initial)
        .centroid()
        .ok_or(RegistrationError::EmptySource)?;

    log::debug!(
        "azimuth search over {} candidates in [{:.1}, {:.1}] deg",
        candidates.len(),
        -params.range.to_degrees() / 2.0,
        params.range.to_degrees() / 2.0
    );

    let done = AtomicBool::new(false);
    let outcomes = candidates
        .par_iter()
        .map(|&azimuth| {
            if done.load(AtomicOrdering::Relaxed) {
                return None;
            }
            let start = Transform::rotation_z_about(azimuth, pivot) * *initial;
            let outcome = icp.register_with_symmetries(source, &start);
            if let (Ok(result), Some(target)) = (&outcome, params.target_fitness) {
                if result.fitness <= target {
                    done.store(true, AtomicOrdering::Relaxed);
                }
            }
            Some((azimuth, outcome))
        })
        .collect::<Vec<_>>();

    let mut first_error = None;
    let mut trials = Vec::with_capacity(outcomes.len());
    let mut results = Vec::with_capacity(outcomes.len());
    for (azimuth, outcome) in outcomes.into_iter().flatten() {
        match outcome {
            Ok(result) => {
                trials.push(AzimuthTrial {
                    azimuth,
                    fitness: result.fitness,
                    converged: result.converged,
                });
                results.push(result);
            }
            Err(err) => {
                log::debug!("azimuth {:.1} deg failed: {err}", azimuth.to_degrees());
                first_error.get_or_insert(err);
            }
        }
    }

    let best = trials
        .iter()
        .enumerate()
        .min_by(|a, b| compare_trials(*a, *b))
        .map(|(k, trial)| (k, trial.azimuth));
    let Some((k, azimuth)) = best else {
        return Err(first_error.unwrap_or(RegistrationError::EmptySource));
    };
    let result = results.swap_remove(k);

    log::info!(
        "best azimuth {:.1} deg with fitness {:.3e} out of {} trials",
        azimuth.to_degrees(),
        result.fitness,
        trials.len()
    );

    Ok(AzimuthSearchResult {
        result,
        azimuth,
        trials,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DofMask, RegistrationParams};
    use approx::assert_relative_eq;
    use glam::DVec3;

    // an L-shaped footprint with a post, so every yaw looks different
    fn l_shape() -> PointCloud {
        let mut points = Vec::new();
        for i in 0..40 {
            for j in 0..8 {
                let (a, b) = (i as f64 * 0.005, j as f64 * 0.005);
                points.push([a, b, 0.0]);
                if i >= 8 {
                    points.push([b, a, 0.0]);
                }
            }
        }
        for k in 1..20 {
            points.push([0.17, 0.02, k as f64 * 0.005]);
        }
        PointCloud::new(points, None)
    }

    fn registration_params() -> RegistrationParams {
        RegistrationParams {
            dof_mask: DofMask::NoRollPitch,
            max_iterations: 100,
            max_correspondence_distance: 0.05,
            outlier_rejection_threshold: 0.05,
            transformation_epsilon: 1e-9,
            ..Default::default()
        }
    }

    #[test]
    fn test_azimuth_candidates() -> Result<(), RegistrationError> {
        assert_eq!(azimuth_candidates(0.0, 0.1)?, vec![0.0]);

        let candidates = azimuth_candidates(90f64.to_radians(), 5f64.to_radians())?;
        assert_eq!(candidates.len(), 19);
        assert_relative_eq!(candidates[0], -45f64.to_radians(), epsilon = 1e-12);
        assert_relative_eq!(candidates[9], 0.0, epsilon = 1e-12);
        assert_relative_eq!(candidates[18], 45f64.to_radians(), epsilon = 1e-12);

        // the upper bound is kept when the step does not divide the range
        let candidates = azimuth_candidates(1.0, 0.3)?;
        assert_eq!(candidates.len(), 5);
        assert_relative_eq!(candidates[4], 0.5, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_azimuth_candidates_invalid() {
        assert!(matches!(
            azimuth_candidates(1.0, 0.0),
            Err(RegistrationError::InvalidSearchRange { .. })
        ));
        assert!(matches!(
            azimuth_candidates(-1.0, 0.1),
            Err(RegistrationError::InvalidSearchRange { .. })
        ));
        assert!(azimuth_candidates(f64::NAN, 0.1).is_err());
    }

    #[test]
    fn test_search_recovers_large_yaw() -> Result<(), Box<dyn std::error::Error>> {
        let source = l_shape();
        let centroid = source.centroid().ok_or("empty")?;
        let yaw = 70f64.to_radians();
        let truth = Transform::from_translation(DVec3::new(0.3, 0.1, 0.0))
            * Transform::rotation_z_about(yaw, centroid);
        let target = source.transformed(&truth);

        let icp = DofIcp::new(&target, registration_params())?;
        let initial = Transform::from_translation(DVec3::new(0.3, 0.1, 0.0));
        let search = search_azimuth(
            &icp,
            &source,
            &initial,
            &AzimuthSearchParams {
                range: 180f64.to_radians(),
                step: 10f64.to_radians(),
                target_fitness: None,
            },
        )?;

        assert_eq!(search.trials.len(), 19);
        assert!(search.result.fitness < 1e-10);
        assert_relative_eq!(search.result.transform.yaw(), yaw, epsilon = 1e-4);

        // the winner is at least as good as starting without any rotation
        let zero = search
            .trials
            .iter()
            .find(|t| t.azimuth.abs() < 1e-12)
            .ok_or("no zero candidate")?;
        assert!(search.result.fitness <= zero.fitness);
        Ok(())
    }

    #[test]
    fn test_search_is_deterministic() -> Result<(), Box<dyn std::error::Error>> {
        let source = l_shape();
        let target = source.transformed(&Transform::from_rotation_z(0.4));
        let icp = DofIcp::new(&target, registration_params())?;
        let params = AzimuthSearchParams {
            range: 90f64.to_radians(),
            step: 15f64.to_radians(),
            target_fitness: None,
        };
        let a = search_azimuth(&icp, &source, &Transform::IDENTITY, &params)?;
        let b = search_azimuth(&icp, &source, &Transform::IDENTITY, &params)?;
        assert_eq!(a.azimuth, b.azimuth);
        assert_eq!(a.trials, b.trials);
        assert!(a.result.transform.approx_eq(&b.result.transform, 0.0));
        Ok(())
    }

    #[test]
    fn test_search_stops_at_target_fitness() -> Result<(), Box<dyn std::error::Error>> {
        let source = l_shape();
        let target = source.transformed(&Transform::from_rotation_z(0.4));
        let icp = DofIcp::new(&target, registration_params())?;
        let params = AzimuthSearchParams {
            range: 90f64.to_radians(),
            step: 15f64.to_radians(),
            target_fitness: Some(1.0),
        };
        let num_candidates = azimuth_candidates(params.range, params.step)?.len();

        let search = search_azimuth(&icp, &source, &Transform::IDENTITY, &params)?;
        assert!(!search.trials.is_empty());
        assert!(search.trials.len() <= num_candidates);
        assert!(search.result.fitness <= 1.0);
        assert!(search
            .trials
            .iter()
            .any(|t| t.azimuth == search.azimuth && t.fitness == search.result.fitness));

        // a single worker finishes the first candidate and skips the rest
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build()?;
        let search = pool.install(|| search_azimuth(&icp, &source, &Transform::IDENTITY, &params))?;
        assert_eq!(search.trials.len(), 1);
        assert!(search.result.fitness <= 1.0);
        Ok(())
    }

    #[test]
    fn test_search_fails_without_overlap() -> Result<(), Box<dyn std::error::Error>> {
        let source = l_shape();
        let target = source.transformed(&Transform::from_translation(DVec3::new(10.0, 0.0, 0.0)));
        let icp = DofIcp::new(&target, registration_params())?;
        let result = search_azimuth(
            &icp,
            &source,
            &Transform::IDENTITY,
            &AzimuthSearchParams::default(),
        );
        assert!(matches!(
            result,
            Err(RegistrationError::InsufficientCorrespondences { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_compare_trials_tie_breaks() {
        let a = AzimuthTrial {
            azimuth: -0.2,
            fitness: 1.0,
            converged: true,
        };
        let b = AzimuthTrial {
            azimuth: 0.1,
            fitness: 1.0,
            converged: true,
        };
        let c = AzimuthTrial {
            azimuth: 0.0,
            fitness: f64::NAN,
            converged: false,
        };
        assert_eq!(compare_trials((0, &a), (1, &b)), Ordering::Greater);
        assert_eq!(compare_trials((1, &b), (2, &c)), Ordering::Less);
        assert_eq!(compare_trials((0, &b), (1, &b)), Ordering::Less);
    }
}
