use std::collections::BTreeMap;

use glam::DVec3;

use crate::filters::CloudError;
use crate::pointcloud::PointCloud;

/// Accumulated data of one voxel: point sum, color sum, intensity sum and count.
type VoxelData = (DVec3, [u64; 3], f64, usize);

/// A 3D voxel grid for downsampling point clouds.
///
/// Voxels are visited in index order, so the output is deterministic for a given input.
#[derive(Debug, Clone)]
pub struct VoxelGrid {
    /// The size of the voxel (leaf) in x, y, z dimensions.
    leaf_size: DVec3,
    /// Minimum number of points required per voxel.
    min_points_per_voxel: usize,
}

impl VoxelGrid {
    /// Creates a new `VoxelGrid` with the specified leaf size.
    ///
    /// Returns [`CloudError::InvalidLeafSize`] if any dimension of `leaf_size` is not
    /// strictly positive.
    pub fn new(leaf_size: DVec3) -> Result<Self, CloudError> {
        validate_leaf_size(leaf_size)?;
        Ok(VoxelGrid {
            leaf_size,
            min_points_per_voxel: 1,
        })
    }

    /// Creates a grid with cubic voxels.
    pub fn uniform(leaf_size: f64) -> Result<Self, CloudError> {
        Self::new(DVec3::splat(leaf_size))
    }

    /// Downsamples the input point cloud by grouping points into voxels and computing centroids.
    ///
    /// Colors and intensities are averaged per voxel when present. Points with a NaN or
    /// infinite coordinate are skipped, so the result may be empty.
    pub fn downsample(&self, point_cloud: &PointCloud) -> PointCloud {
        let mut grid: BTreeMap<(i64, i64, i64), VoxelData> = BTreeMap::new();
        let mut skipped = 0usize;

        // group points into voxels
        for (i, point) in point_cloud.points().iter().enumerate() {
            if !point.iter().all(|v| v.is_finite()) {
                skipped += 1;
                continue;
            }
            let key = self.voxel_index(point);
            let entry = grid.entry(key).or_insert((DVec3::ZERO, [0; 3], 0.0, 0));
            entry.0 += DVec3::from_array(*point);
            if let Some(color) = point_cloud.colors().and_then(|c| c.get(i)) {
                entry.1[0] += color[0] as u64;
                entry.1[1] += color[1] as u64;
                entry.1[2] += color[2] as u64;
            }
            if let Some(intensity) = point_cloud.intensities().and_then(|v| v.get(i)) {
                entry.2 += *intensity as f64;
            }
            entry.3 += 1;
        }
        if skipped > 0 {
            log::debug!("voxel grid skipped {skipped} non-finite points");
        }

        let mut points = Vec::with_capacity(grid.len());
        let mut colors = point_cloud.colors().map(|_| Vec::with_capacity(grid.len()));
        let mut intensities = point_cloud
            .intensities()
            .map(|_| Vec::with_capacity(grid.len()));

        // compute centroids for each voxel
        for (sum, color_sum, intensity_sum, count) in grid.into_values() {
            if count < self.min_points_per_voxel {
                continue;
            }
            let inv_count = 1.0 / count as f64;
            points.push((sum * inv_count).to_array());
            if let Some(ref mut colors) = colors {
                colors.push([
                    (color_sum[0] as f64 * inv_count).round() as u8,
                    (color_sum[1] as f64 * inv_count).round() as u8,
                    (color_sum[2] as f64 * inv_count).round() as u8,
                ]);
            }
            if let Some(ref mut intensities) = intensities {
                intensities.push((intensity_sum * inv_count) as f32);
            }
        }

        PointCloud::from_parts(points, colors, intensities)
    }

    /// Computes the voxel index for a given point.
    pub fn voxel_index(&self, point: &[f64; 3]) -> (i64, i64, i64) {
        (
            (point[0] / self.leaf_size.x).floor() as i64,
            (point[1] / self.leaf_size.y).floor() as i64,
            (point[2] / self.leaf_size.z).floor() as i64,
        )
    }

    /// Sets the voxel grid leaf size.
    pub fn set_leaf_size(&mut self, leaf_size: DVec3) -> Result<(), CloudError> {
        validate_leaf_size(leaf_size)?;
        self.leaf_size = leaf_size;
        Ok(())
    }

    /// Gets the voxel grid leaf size.
    pub fn leaf_size(&self) -> DVec3 {
        self.leaf_size
    }

    /// Sets the minimum number of points required per voxel.
    pub fn set_min_points_per_voxel(&mut self, min_points: usize) {
        self.min_points_per_voxel = min_points;
    }

    /// Gets the minimum number of points required per voxel.
    pub fn min_points_per_voxel(&self) -> usize {
        self.min_points_per_voxel
    }
}

fn validate_leaf_size(leaf_size: DVec3) -> Result<(), CloudError> {
    if !(leaf_size.x > 0.0 && leaf_size.y > 0.0 && leaf_size.z > 0.0) {
        return Err(CloudError::InvalidLeafSize(leaf_size.min_element()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_points_only() -> Result<(), CloudError> {
        let point_cloud = PointCloud::new(vec![[1.0, 1.0, 1.0], [1.1, 1.1, 1.1]], None);
        let voxel_grid = VoxelGrid::uniform(1.0)?;

        let downsampled = voxel_grid.downsample(&point_cloud);
        assert_eq!(downsampled.len(), 1);
        let centroid = downsampled.points()[0];
        assert!((centroid[0] - 1.05).abs() < 0.01);
        assert!((centroid[1] - 1.05).abs() < 0.01);
        assert!((centroid[2] - 1.05).abs() < 0.01);
        assert!(downsampled.colors().is_none());
        assert!(downsampled.intensities().is_none());
        Ok(())
    }

    #[test]
    fn test_downsample_with_colors() -> Result<(), CloudError> {
        let point_cloud = PointCloud::new(
            vec![[1.0, 1.0, 1.0], [1.1, 1.1, 1.1], [3.5, 0.0, 0.0]],
            Some(vec![[255, 0, 0], [0, 255, 0], [1, 2, 3]]),
        );
        let downsampled = VoxelGrid::uniform(1.0)?.downsample(&point_cloud);
        assert_eq!(downsampled.len(), 2);
        let colors = downsampled.colors().ok_or(CloudError::EmptyResult)?;
        // voxels come out in index order: (1, 1, 1) before (3, 0, 0)
        assert_eq!(colors, &[[128, 128, 0], [1, 2, 3]]);
        Ok(())
    }

    #[test]
    fn test_downsample_with_intensities() -> Result<(), CloudError> {
        let point_cloud =
            PointCloud::with_intensities(vec![[0.1, 0.1, 0.1], [0.2, 0.2, 0.2]], vec![1.0, 3.0]);
        let downsampled = VoxelGrid::uniform(1.0)?.downsample(&point_cloud);
        assert_eq!(downsampled.intensities(), Some(&[2.0][..]));
        Ok(())
    }

    #[test]
    fn test_downsample_is_deterministic() -> Result<(), CloudError> {
        let points = (0..500)
            .map(|i| {
                let f = i as f64;
                [(f * 0.37).sin(), (f * 0.11).cos(), (f * 0.05).sin()]
            })
            .collect::<Vec<_>>();
        let point_cloud = PointCloud::new(points, None);
        let voxel_grid = VoxelGrid::uniform(0.1)?;
        assert_eq!(
            voxel_grid.downsample(&point_cloud),
            voxel_grid.downsample(&point_cloud)
        );
        Ok(())
    }

    #[test]
    fn test_downsample_skips_non_finite_points() -> Result<(), CloudError> {
        let point_cloud = PointCloud::new(
            vec![
                [0.2, 0.2, 0.2],
                [f64::NAN, f64::NAN, f64::NAN],
                [0.4, f64::INFINITY, 0.1],
                [0.6, 0.6, 0.6],
            ],
            Some(vec![[10, 10, 10], [255, 255, 255], [255, 0, 0], [30, 30, 30]]),
        );
        let downsampled = VoxelGrid::uniform(1.0)?.downsample(&point_cloud);
        assert_eq!(downsampled.len(), 1);
        assert!(downsampled.points()[0].iter().all(|v| (v - 0.4).abs() < 1e-12));
        assert_eq!(downsampled.colors(), Some(&[[20, 20, 20]][..]));

        let only_nan = PointCloud::new(vec![[f64::NAN, 0.0, 0.0]], None);
        assert!(VoxelGrid::uniform(1.0)?.downsample(&only_nan).is_empty());
        Ok(())
    }

    #[test]
    fn test_min_points_per_voxel() -> Result<(), CloudError> {
        let point_cloud = PointCloud::new(vec![[1.0, 1.0, 1.0]], None);
        let mut voxel_grid = VoxelGrid::uniform(1.0)?;
        voxel_grid.set_min_points_per_voxel(2);
        assert_eq!(voxel_grid.min_points_per_voxel(), 2);
        assert_eq!(voxel_grid.downsample(&point_cloud).len(), 0);
        Ok(())
    }

    #[test]
    fn test_invalid_leaf_size() -> Result<(), CloudError> {
        assert!(matches!(
            VoxelGrid::new(DVec3::new(0.0, 1.0, 1.0)),
            Err(CloudError::InvalidLeafSize(_))
        ));
        let mut voxel_grid = VoxelGrid::uniform(1.0)?;
        assert!(voxel_grid.set_leaf_size(DVec3::new(-1.0, 1.0, 1.0)).is_err());
        assert_eq!(voxel_grid.leaf_size(), DVec3::ONE);
        Ok(())
    }
}
