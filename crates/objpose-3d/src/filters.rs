//! Scene preprocessing: box cropping, voxel downsampling and scan-skew correction.

use glam::DVec3;

use crate::plane::{estimate_perpendicular_plane, PlaneError, RansacParams};
use crate::pointcloud::PointCloud;
use crate::transforms::Axis;
use crate::voxel_grid::VoxelGrid;

/// Error types for the cloud filters.
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// The filter did not keep a single point.
    #[error("filter produced an empty point cloud")]
    EmptyResult,

    /// The voxel leaf size must be strictly positive.
    #[error("invalid voxel leaf size {0}, must be > 0")]
    InvalidLeafSize(f64),

    /// The crop box size must be strictly positive along every axis.
    #[error("invalid crop box size {0:?}, must be > 0 along every axis")]
    InvalidBoxSize([f64; 3]),

    /// The scan axis and the height axis of the distortion model coincide.
    #[error("scan axis and height axis must differ, both are {0:?}")]
    InvalidAxes(Axis),

    /// The support plane used to measure the scan skew could not be found.
    #[error(transparent)]
    Plane(#[from] PlaneError),
}

/// An axis-aligned box given by its center and full side lengths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropBox {
    /// Center of the box.
    pub center: DVec3,
    /// Side lengths along x, y and z.
    pub size: DVec3,
}

impl CropBox {
    /// Create a box from its center and size, rejecting non-positive sizes.
    pub fn new(center: DVec3, size: DVec3) -> Result<Self, CloudError> {
        if !(size.x > 0.0 && size.y > 0.0 && size.z > 0.0) {
            return Err(CloudError::InvalidBoxSize(size.to_array()));
        }
        Ok(Self { center, size })
    }

    /// Lower corner of the box.
    pub fn min_pt(&self) -> DVec3 {
        self.center - self.size * 0.5
    }

    /// Upper corner of the box.
    pub fn max_pt(&self) -> DVec3 {
        self.center + self.size * 0.5
    }

    /// Whether `point` lies inside the box, bounds included.
    #[inline]
    pub fn contains(&self, point: &[f64; 3]) -> bool {
        let (lo, hi) = (self.min_pt(), self.max_pt());
        (lo.x..=hi.x).contains(&point[0])
            && (lo.y..=hi.y).contains(&point[1])
            && (lo.z..=hi.z).contains(&point[2])
    }
}

/// Keep the points inside `crop_box`.
///
/// Returns [`CloudError::EmptyResult`] if no point survives.
pub fn crop_box(cloud: &PointCloud, crop_box: &CropBox) -> Result<PointCloud, CloudError> {
    let cropped = cloud.filter(|_, p| crop_box.contains(p));
    if cropped.is_empty() {
        return Err(CloudError::EmptyResult);
    }
    Ok(cropped)
}

/// Crop to an axis-aligned box and voxel-downsample the result.
///
/// # Arguments
///
/// * `cloud` - The input cloud, left untouched.
/// * `box_center` - Center of the crop box.
/// * `box_size` - Side lengths of the crop box.
/// * `leaf_size` - Voxel size of the downsampling grid.
pub fn crop_subsample(
    cloud: &PointCloud,
    box_center: DVec3,
    box_size: DVec3,
    leaf_size: f64,
) -> Result<PointCloud, CloudError> {
    let voxel_grid = VoxelGrid::uniform(leaf_size)?;
    let cropped = crop_box(cloud, &CropBox::new(box_center, box_size)?)?;
    let downsampled = voxel_grid.downsample(&cropped);
    log::debug!(
        "crop_subsample: {} -> {} -> {} points",
        cloud.len(),
        cropped.len(),
        downsampled.len()
    );
    Ok(downsampled)
}

/// Model of the skew produced by a line-scan sensor moving while it captures.
///
/// The motion shifts the measured height linearly with the scan coordinate, so a flat
/// support surface shows up tilted along the scan axis. The correction measures that
/// slope on the support plane and removes it with the inverse shear.
#[derive(Debug, Clone)]
pub struct ScanDistortion {
    /// Whether the input is distorted at all. When false the correction is a no-op.
    pub distorted: bool,
    /// Axis along which the sensor sweeps.
    pub scan_axis: Axis,
    /// Axis along which heights are measured.
    pub height_axis: Axis,
    /// Maximum tilt of the support plane relative to the height axis, in radians.
    pub angle_tolerance: f64,
    /// Inlier distance for the support plane fit.
    pub inlier_threshold: f64,
    /// Sampling parameters of the plane fit.
    pub ransac: RansacParams,
}

impl Default for ScanDistortion {
    fn default() -> Self {
        Self {
            distorted: false,
            scan_axis: Axis::Y,
            height_axis: Axis::Z,
            angle_tolerance: 30f64.to_radians(),
            inlier_threshold: 0.005,
            ransac: RansacParams::default(),
        }
    }
}

/// Remove the scan skew described by `distortion` from `cloud`.
///
/// Returns a copy of the input when `distortion.distorted` is false.
pub fn remove_distortion(
    cloud: &PointCloud,
    distortion: &ScanDistortion,
) -> Result<PointCloud, CloudError> {
    if !distortion.distorted {
        return Ok(cloud.clone());
    }
    if distortion.scan_axis == distortion.height_axis {
        return Err(CloudError::InvalidAxes(distortion.scan_axis));
    }

    let fit = estimate_perpendicular_plane(
        cloud,
        distortion.height_axis.unit(),
        distortion.angle_tolerance,
        distortion.inlier_threshold,
        &distortion.ransac,
    )?;

    let (s, h) = (distortion.scan_axis.index(), distortion.height_axis.index());
    let normal = fit.model.normal().to_array();
    // height = -(n_s * s + ... + d) / n_h, so the slope along the scan axis is -n_s / n_h
    let slope = -normal[s] / normal[h];
    let inliers = fit.model.inliers();
    let pivot = inliers.iter().map(|&i| cloud.points()[i][s]).sum::<f64>() / inliers.len() as f64;

    log::debug!("remove_distortion: slope {slope:.5} around scan coordinate {pivot:.4}");

    let points = cloud
        .points()
        .iter()
        .map(|p| {
            let mut q = *p;
            q[h] -= slope * (p[s] - pivot);
            q
        })
        .collect();
    Ok(cloud.with_points(points))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid(n: usize, spacing: f64, height: impl Fn(f64, f64) -> f64) -> Vec<[f64; 3]> {
        let mut points = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                let (x, y) = (i as f64 * spacing, j as f64 * spacing);
                points.push([x, y, height(x, y)]);
            }
        }
        points
    }

    #[test]
    fn test_crop_box() -> Result<(), CloudError> {
        let cloud = PointCloud::new(grid(10, 0.1, |_, _| 0.0), None);
        let cropped = crop_box(
            &cloud,
            &CropBox::new(DVec3::new(0.0, 0.0, 0.0), DVec3::new(0.25, 0.25, 1.0))?,
        )?;
        // x, y in {0.0, 0.1}
        assert_eq!(cropped.len(), 4);
        assert_eq!(cloud.len(), 100);
        Ok(())
    }

    #[test]
    fn test_crop_box_outside_is_empty() -> Result<(), CloudError> {
        let cloud = PointCloud::new(grid(10, 0.1, |_, _| 0.0), None);
        let result = crop_subsample(&cloud, DVec3::new(5.0, 5.0, 5.0), DVec3::ONE, 0.01);
        assert!(matches!(result, Err(CloudError::EmptyResult)));
        Ok(())
    }

    #[test]
    fn test_crop_subsample_rejects_bad_parameters() {
        let cloud = PointCloud::new(grid(4, 0.1, |_, _| 0.0), None);
        assert!(matches!(
            crop_subsample(&cloud, DVec3::ZERO, DVec3::ONE, 0.0),
            Err(CloudError::InvalidLeafSize(_))
        ));
        assert!(matches!(
            crop_subsample(&cloud, DVec3::ZERO, DVec3::new(1.0, -1.0, 1.0), 0.1),
            Err(CloudError::InvalidBoxSize(_))
        ));
    }

    #[test]
    fn test_crop_subsample_downsamples() -> Result<(), CloudError> {
        let cloud = PointCloud::new(grid(20, 0.01, |_, _| 0.0), None);
        let out = crop_subsample(&cloud, DVec3::new(0.1, 0.1, 0.0), DVec3::splat(1.0), 0.05)?;
        // 20 points per axis over 0.19 m fall in 4 voxels per axis
        assert_eq!(out.len(), 16);
        Ok(())
    }

    #[test]
    fn test_remove_distortion_noop() -> Result<(), CloudError> {
        let cloud = PointCloud::new(grid(5, 0.1, |_, y| 0.2 * y), None);
        let out = remove_distortion(&cloud, &ScanDistortion::default())?;
        assert_eq!(out, cloud);
        Ok(())
    }

    #[test]
    fn test_remove_distortion_flattens_skew() -> Result<(), CloudError> {
        let slope = 0.1;
        let mut points = grid(30, 0.02, |_, y| 0.5 + slope * y);
        // a point standing 5 cm above the skewed surface
        points.push([0.3, 0.3, 0.5 + slope * 0.3 + 0.05]);
        let cloud = PointCloud::new(points, None);

        let distortion = ScanDistortion {
            distorted: true,
            ransac: RansacParams {
                random_seed: Some(3),
                ..Default::default()
            },
            ..Default::default()
        };
        let out = remove_distortion(&cloud, &distortion)?;

        let heights = out.points()[..900].iter().map(|p| p[2]).collect::<Vec<_>>();
        let first = heights[0];
        for h in heights.iter() {
            assert_relative_eq!(*h, first, epsilon = 1e-6);
        }
        let top = out.points()[900];
        assert_relative_eq!(top[2] - first, 0.05, epsilon = 1e-6);
        // x and y untouched
        assert_eq!(top[0], 0.3);
        assert_eq!(top[1], 0.3);
        Ok(())
    }

    #[test]
    fn test_remove_distortion_along_y_height() -> Result<(), CloudError> {
        let slope = -0.08;
        let points = grid(30, 0.02, |_, _| 0.0)
            .into_iter()
            .map(|[x, s, _]| [x, 0.5 + slope * s, s])
            .collect::<Vec<_>>();
        let cloud = PointCloud::new(points, None);

        let distortion = ScanDistortion {
            distorted: true,
            scan_axis: Axis::Z,
            height_axis: Axis::Y,
            ransac: RansacParams {
                random_seed: Some(5),
                ..Default::default()
            },
            ..Default::default()
        };
        let out = remove_distortion(&cloud, &distortion)?;
        let first = out.points()[0][1];
        for (p, q) in out.points().iter().zip(cloud.points()) {
            assert_relative_eq!(p[1], first, epsilon = 1e-6);
            assert_eq!(p[0], q[0]);
            assert_eq!(p[2], q[2]);
        }
        Ok(())
    }

    #[test]
    fn test_remove_distortion_invalid_axes() {
        let cloud = PointCloud::new(grid(5, 0.1, |_, _| 0.0), None);
        let distortion = ScanDistortion {
            distorted: true,
            scan_axis: Axis::Z,
            ..Default::default()
        };
        assert!(matches!(
            remove_distortion(&cloud, &distortion),
            Err(CloudError::InvalidAxes(Axis::Z))
        ));
    }
}
