//! Robust plane estimation constrained to a reference axis.

use glam::{DVec2, DVec3};
use rand::{rngs::StdRng, seq::index::sample, SeedableRng};

use crate::pointcloud::PointCloud;

/// Error types for the plane estimation.
#[derive(Debug, thiserror::Error)]
pub enum PlaneError {
    /// Not enough points satisfy the plane constraints.
    #[error("no plane found: needed {required} inliers, best candidate had {actual}")]
    NoPlaneFound {
        /// Minimum number of inliers required.
        required: usize,
        /// Inliers of the best candidate.
        actual: usize,
    },

    /// The reference axis has zero length.
    #[error("the reference axis must be non-zero")]
    InvalidReferenceAxis,

    /// A numeric parameter is out of range.
    #[error("invalid plane parameter: {0}")]
    InvalidParameter(String),
}

/// Parameters of the RANSAC search.
#[derive(Debug, Clone)]
pub struct RansacParams {
    /// Maximum number of sampled hypotheses.
    pub max_iterations: usize,
    /// Desired probability that at least one sample is outlier-free.
    pub confidence: f64,
    /// Optional fixed seed for reproducible sampling.
    pub random_seed: Option<u64>,
    /// Minimum number of inliers for a plane to be accepted.
    pub min_inliers: usize,
    /// Whether to refit the plane on all inliers by least squares.
    pub refine: bool,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            confidence: 0.999,
            random_seed: Some(0),
            min_inliers: 3,
            refine: true,
        }
    }
}

/// A plane `ax + by + cz + d = 0` with unit normal `(a, b, c)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneModel {
    coefficients: [f64; 4],
    inliers: Vec<usize>,
    hull: Vec<[f64; 3]>,
}

impl PlaneModel {
    /// Plane through `point` with the given normal. The normal is normalized.
    pub fn from_point_normal(point: DVec3, normal: DVec3) -> Option<Self> {
        let normal = normal.try_normalize()?;
        Some(Self {
            coefficients: [normal.x, normal.y, normal.z, -normal.dot(point)],
            inliers: Vec::new(),
            hull: Vec::new(),
        })
    }

    /// The coefficients `[a, b, c, d]`.
    pub fn coefficients(&self) -> [f64; 4] {
        self.coefficients
    }

    /// The unit normal.
    pub fn normal(&self) -> DVec3 {
        DVec3::new(
            self.coefficients[0],
            self.coefficients[1],
            self.coefficients[2],
        )
    }

    /// Indices of the inliers in the cloud the plane was fitted on.
    pub fn inliers(&self) -> &[usize] {
        &self.inliers
    }

    /// Convex hull of the inliers projected onto the plane, counter-clockwise around the normal.
    pub fn hull(&self) -> &[[f64; 3]] {
        &self.hull
    }

    /// Signed distance of `point`, positive on the side the normal points to.
    #[inline]
    pub fn signed_distance(&self, point: &[f64; 3]) -> f64 {
        let [a, b, c, d] = self.coefficients;
        a * point[0] + b * point[1] + c * point[2] + d
    }

    /// Unsigned point-to-plane distance.
    #[inline]
    pub fn distance(&self, point: &[f64; 3]) -> f64 {
        self.signed_distance(point).abs()
    }

    /// Orthogonal projection of `point` onto the plane.
    pub fn project(&self, point: &[f64; 3]) -> [f64; 3] {
        let p = DVec3::from_array(*point);
        (p - self.normal() * self.signed_distance(point)).to_array()
    }

    /// Whether the projection of `point` falls inside the inlier hull.
    pub fn hull_contains(&self, point: &[f64; 3]) -> bool {
        if self.hull.len() < 3 {
            return false;
        }
        let basis = PlaneBasis::new(self.normal());
        let q = basis.to_2d(point);
        let polygon = self.hull.iter().map(|p| basis.to_2d(p)).collect::<Vec<_>>();
        polygon
            .iter()
            .zip(polygon.iter().cycle().skip(1))
            .all(|(a, b)| cross2(*b - *a, q - *a) >= -1e-12)
    }

    fn oriented_towards(mut self, axis: DVec3) -> Self {
        if self.normal().dot(axis) < 0.0 {
            self.coefficients = self.coefficients.map(|c| -c);
        }
        self
    }

    fn collect_inliers(&self, points: &[[f64; 3]], threshold: f64) -> Vec<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| self.distance(p) <= threshold)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Result of a plane fit.
#[derive(Debug, Clone)]
pub struct PlaneFit {
    /// The fitted plane, its inlier indices and hull.
    pub model: PlaneModel,
    /// The inlier points as a new cloud.
    pub inlier_cloud: PointCloud,
}

/// Fit a plane whose normal lies within `angle_tolerance` of `reference_axis`.
///
/// Minimal samples of three points are drawn until the adaptive iteration bound or
/// `params.max_iterations` is reached; the candidate with most inliers wins and is
/// optionally refit on its inliers. The returned normal points to the same side as
/// `reference_axis`.
///
/// # Arguments
///
/// * `cloud` - The input cloud.
/// * `reference_axis` - Axis the plane normal must be close to.
/// * `angle_tolerance` - Maximum angle in radians between the normal and the axis.
/// * `inlier_threshold` - Maximum point-to-plane distance of an inlier.
/// * `params` - RANSAC parameters.
pub fn estimate_perpendicular_plane(
    cloud: &PointCloud,
    reference_axis: DVec3,
    angle_tolerance: f64,
    inlier_threshold: f64,
    params: &RansacParams,
) -> Result<PlaneFit, PlaneError> {
    let axis = reference_axis
        .try_normalize()
        .ok_or(PlaneError::InvalidReferenceAxis)?;
    if !(inlier_threshold > 0.0) {
        return Err(PlaneError::InvalidParameter(format!(
            "inlier threshold must be > 0, got {inlier_threshold}"
        )));
    }
    if !(angle_tolerance >= 0.0) {
        return Err(PlaneError::InvalidParameter(format!(
            "angle tolerance must be >= 0, got {angle_tolerance}"
        )));
    }

    let points = cloud.points();
    let n = points.len();
    let required = params.min_inliers.max(3);
    if n < 3 {
        return Err(PlaneError::NoPlaneFound {
            required,
            actual: n,
        });
    }

    let cos_tolerance = angle_tolerance.cos();
    let within_tolerance = |model: &PlaneModel| model.normal().dot(axis) >= cos_tolerance - 1e-12;

    let mut rng = match params.random_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let mut best: Option<(PlaneModel, usize)> = None;
    let mut required_iters = params.max_iterations;
    let mut iter = 0;

    while iter < required_iters {
        iter += 1;

        let sample = sample(&mut rng, n, 3).into_vec();
        let Some(model) = plane_from_points(&points[sample[0]], &points[sample[1]], &points[sample[2]])
        else {
            continue;
        };
        let model = model.oriented_towards(axis);
        if !within_tolerance(&model) {
            continue;
        }

        let count = points
            .iter()
            .filter(|p| model.distance(p) <= inlier_threshold)
            .count();

        if best.as_ref().map_or(true, |(_, c)| count > *c) {
            log::debug!("ransac iter {iter}: {count}/{n} inliers");

            // shrink the iteration budget from the current inlier ratio
            let w = count as f64 / n as f64;
            let ws = w.powi(3);
            if ws >= 1.0 - 1e-12 {
                required_iters = iter;
            } else if ws > 1e-12 {
                let est = ((1.0 - params.confidence).max(1e-12).ln() / (1.0 - ws).ln()).ceil();
                if est.is_finite() && est > 0.0 {
                    required_iters = required_iters.min(est as usize);
                }
            }
            best = Some((model, count));
        }
    }

    let (mut model, count) = best.ok_or(PlaneError::NoPlaneFound {
        required,
        actual: 0,
    })?;
    if count < required {
        return Err(PlaneError::NoPlaneFound {
            required,
            actual: count,
        });
    }
    let mut inliers = model.collect_inliers(points, inlier_threshold);

    if params.refine {
        let inlier_points = inliers.iter().map(|&i| points[i]).collect::<Vec<_>>();
        if let Some(refined) = fit_plane_least_squares(&inlier_points) {
            let refined = refined.oriented_towards(axis);
            let refined_inliers = refined.collect_inliers(points, inlier_threshold);
            if within_tolerance(&refined) && refined_inliers.len() >= required {
                model = refined;
                inliers = refined_inliers;
            }
        }
    }

    let inlier_cloud = cloud.select(&inliers);
    model.hull = convex_hull(inlier_cloud.points(), &model);
    model.inliers = inliers;

    log::debug!(
        "plane {:?} with {} inliers after {} iterations",
        model.coefficients,
        model.inliers.len(),
        iter
    );

    Ok(PlaneFit {
        model,
        inlier_cloud,
    })
}

/// Plane through three points, `None` if they are (nearly) collinear.
pub fn plane_from_points(p0: &[f64; 3], p1: &[f64; 3], p2: &[f64; 3]) -> Option<PlaneModel> {
    let (a, b, c) = (
        DVec3::from_array(*p0),
        DVec3::from_array(*p1),
        DVec3::from_array(*p2),
    );
    let normal = (b - a).cross(c - a);
    if normal.length_squared() < 1e-20 {
        return None;
    }
    PlaneModel::from_point_normal(a, normal)
}

/// Least-squares plane through `points`: the normal is the direction of least variance.
pub fn fit_plane_least_squares(points: &[[f64; 3]]) -> Option<PlaneModel> {
    if points.len() < 3 {
        return None;
    }
    let centroid = points
        .iter()
        .fold(DVec3::ZERO, |acc, p| acc + DVec3::from_array(*p))
        / points.len() as f64;

    let mut cov = [[0.0; 3]; 3];
    for p in points {
        let d = DVec3::from_array(*p) - centroid;
        let d = d.to_array();
        for (i, row) in cov.iter_mut().enumerate() {
            for (j, val) in row.iter_mut().enumerate() {
                *val += d[i] * d[j];
            }
        }
    }

    // singular vectors come sorted by decreasing singular value
    let svd = faer::Mat::<f64>::from_fn(3, 3, |i, j| cov[i][j]).svd();
    let v = svd.v();
    let normal = DVec3::new(v.read(0, 2), v.read(1, 2), v.read(2, 2));
    if !normal.is_finite() {
        return None;
    }
    PlaneModel::from_point_normal(centroid, normal)
}

/// Convex hull of `points` projected onto `plane`, counter-clockwise around its normal.
pub fn convex_hull(points: &[[f64; 3]], plane: &PlaneModel) -> Vec<[f64; 3]> {
    let basis = PlaneBasis::new(plane.normal());
    let mut projected = points
        .iter()
        .map(|p| {
            let q = plane.project(p);
            (basis.to_2d(&q), q)
        })
        .collect::<Vec<_>>();
    if projected.len() < 3 {
        return projected.into_iter().map(|(_, q)| q).collect();
    }

    projected.sort_by(|a, b| a.0.x.total_cmp(&b.0.x).then(a.0.y.total_cmp(&b.0.y)));

    // Andrew's monotone chain
    let mut hull: Vec<(DVec2, [f64; 3])> = Vec::with_capacity(2 * projected.len());
    for pass in 0..2 {
        let start = hull.len();
        let ordered: Box<dyn Iterator<Item = &(DVec2, [f64; 3])>> = if pass == 0 {
            Box::new(projected.iter())
        } else {
            Box::new(projected.iter().rev())
        };
        for &(p2, p3) in ordered {
            while hull.len() >= start + 2 {
                let a = hull[hull.len() - 2].0;
                let b = hull[hull.len() - 1].0;
                if cross2(b - a, p2 - a) > 1e-15 {
                    break;
                }
                hull.pop();
            }
            hull.push((p2, p3));
        }
        // the last point of each chain is the first of the other
        hull.pop();
    }
    hull.into_iter().map(|(_, q)| q).collect()
}

/// Indices of the points above `plane` whose projection lies inside its hull.
///
/// A point is kept when its signed height is in `(min_height, max_height]`.
pub fn extract_prism(
    cloud: &PointCloud,
    plane: &PlaneModel,
    min_height: f64,
    max_height: f64,
) -> Vec<usize> {
    cloud
        .points()
        .iter()
        .enumerate()
        .filter(|(_, p)| {
            let h = plane.signed_distance(p);
            h > min_height && h <= max_height && plane.hull_contains(p)
        })
        .map(|(i, _)| i)
        .collect()
}

#[inline]
fn cross2(a: DVec2, b: DVec2) -> f64 {
    a.x * b.y - a.y * b.x
}

/// Right-handed in-plane basis `(u, v)` with `u x v = normal`.
struct PlaneBasis {
    u: DVec3,
    v: DVec3,
}

impl PlaneBasis {
    fn new(normal: DVec3) -> Self {
        let u = normal.any_orthonormal_vector();
        Self {
            u,
            v: normal.cross(u),
        }
    }

    fn to_2d(&self, p: &[f64; 3]) -> DVec2 {
        let p = DVec3::from_array(*p);
        DVec2::new(self.u.dot(p), self.v.dot(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::Rng;

    fn noisy_plane(rng: &mut StdRng, n: usize, height: f64, noise: f64) -> Vec<[f64; 3]> {
        (0..n)
            .map(|_| {
                [
                    rng.random_range(-0.5..0.5),
                    rng.random_range(-0.5..0.5),
                    height + rng.random_range(-noise..noise),
                ]
            })
            .collect()
    }

    #[test]
    fn test_recovers_plane_with_outliers() -> Result<(), PlaneError> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut points = noisy_plane(&mut rng, 400, 0.1, 0.001);
        // outliers well above the inlier band
        for _ in 0..100 {
            points.push([
                rng.random_range(-0.5..0.5),
                rng.random_range(-0.5..0.5),
                rng.random_range(0.2..0.6),
            ]);
        }
        let cloud = PointCloud::new(points, None);

        let fit = estimate_perpendicular_plane(
            &cloud,
            DVec3::Z,
            20f64.to_radians(),
            0.003,
            &RansacParams::default(),
        )?;

        let normal = fit.model.normal();
        assert!(normal.angle_between(DVec3::Z) < 1f64.to_radians());
        assert_relative_eq!(fit.model.coefficients()[3], -0.1, epsilon = 1e-3);
        assert_eq!(fit.model.inliers().len(), 400);
        assert!(fit.model.inliers().iter().all(|&i| i < 400));
        assert_eq!(fit.inlier_cloud.len(), 400);
        Ok(())
    }

    #[test]
    fn test_is_deterministic_with_seed() -> Result<(), PlaneError> {
        let mut rng = StdRng::seed_from_u64(1);
        let cloud = PointCloud::new(noisy_plane(&mut rng, 200, 0.0, 0.002), None);
        let params = RansacParams {
            random_seed: Some(9),
            ..Default::default()
        };
        let a = estimate_perpendicular_plane(&cloud, DVec3::Z, 0.3, 0.003, &params)?;
        let b = estimate_perpendicular_plane(&cloud, DVec3::Z, 0.3, 0.003, &params)?;
        assert_eq!(a.model, b.model);
        Ok(())
    }

    #[test]
    fn test_rejects_planes_outside_tolerance() {
        // a vertical wall, normal along x
        let points = (0..100)
            .map(|i| [0.0, (i % 10) as f64 * 0.1, (i / 10) as f64 * 0.1])
            .collect::<Vec<_>>();
        let cloud = PointCloud::new(points, None);
        let result = estimate_perpendicular_plane(
            &cloud,
            DVec3::Z,
            20f64.to_radians(),
            0.003,
            &RansacParams::default(),
        );
        assert!(matches!(result, Err(PlaneError::NoPlaneFound { .. })));
    }

    #[test]
    fn test_too_few_points() {
        let cloud = PointCloud::new(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]], None);
        let result =
            estimate_perpendicular_plane(&cloud, DVec3::Z, 0.3, 0.01, &RansacParams::default());
        assert!(matches!(
            result,
            Err(PlaneError::NoPlaneFound {
                required: 3,
                actual: 2
            })
        ));
        let result = estimate_perpendicular_plane(
            &cloud,
            DVec3::ZERO,
            0.3,
            0.01,
            &RansacParams::default(),
        );
        assert!(matches!(result, Err(PlaneError::InvalidReferenceAxis)));
    }

    #[test]
    fn test_normal_follows_reference_axis() -> Result<(), PlaneError> {
        let points = (0..100)
            .map(|i| [(i % 10) as f64 * 0.1, (i / 10) as f64 * 0.1, 0.0])
            .collect::<Vec<_>>();
        let cloud = PointCloud::new(points, None);
        let fit =
            estimate_perpendicular_plane(&cloud, -DVec3::Z, 0.1, 0.001, &RansacParams::default())?;
        assert!(fit.model.normal().abs_diff_eq(-DVec3::Z, 1e-9));
        assert!(fit.model.signed_distance(&[0.0, 0.0, -1.0]) > 0.0);
        Ok(())
    }

    #[test]
    fn test_convex_hull_of_grid() -> Result<(), PlaneError> {
        let points = (0..25)
            .map(|i| [(i % 5) as f64 * 0.25, (i / 5) as f64 * 0.25, 1.0])
            .collect::<Vec<_>>();
        let plane = PlaneModel::from_point_normal(DVec3::new(0.0, 0.0, 1.0), DVec3::Z)
            .ok_or(PlaneError::InvalidReferenceAxis)?;
        let hull = convex_hull(&points, &plane);
        assert_eq!(hull.len(), 4);
        for corner in [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]] {
            assert!(hull
                .iter()
                .any(|p| (p[0] - corner[0]).abs() < 1e-12 && (p[1] - corner[1]).abs() < 1e-12));
        }
        Ok(())
    }

    #[test]
    fn test_extract_prism() -> Result<(), PlaneError> {
        let mut points = (0..100)
            .map(|i| [(i % 10) as f64 * 0.1, (i / 10) as f64 * 0.1, 0.0])
            .collect::<Vec<_>>();
        points.push([0.5, 0.5, 0.2]); // above, inside
        points.push([0.5, 0.5, -0.2]); // below
        points.push([2.0, 2.0, 0.2]); // above, outside the hull
        points.push([0.5, 0.5, 2.0]); // too high
        let cloud = PointCloud::new(points, None);

        let fit = estimate_perpendicular_plane(&cloud, DVec3::Z, 0.1, 0.001, &RansacParams::default())?;
        assert_eq!(fit.model.inliers().len(), 100);
        assert!(fit.model.hull_contains(&[0.5, 0.5, 0.3]));
        assert!(!fit.model.hull_contains(&[2.0, 0.5, 0.3]));

        let prism = extract_prism(&cloud, &fit.model, 0.001, 1.0);
        assert_eq!(prism, vec![100]);
        Ok(())
    }
}
