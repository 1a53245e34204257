use glam::DVec3;

use crate::transforms::Transform;

/// A point cloud with points and optional per-point colors and intensities.
///
/// Clouds are never modified in place by the processing stages: every stage returns a
/// new owned cloud.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    // The points in the point cloud.
    points: Vec<[f64; 3]>,
    // The colors of the points.
    colors: Option<Vec<[u8; 3]>>,
    // The intensities of the points.
    intensities: Option<Vec<f32>>,
}

impl PointCloud {
    /// Create a new point cloud from points and colors (optional).
    ///
    /// A color channel whose length differs from the number of points is dropped.
    pub fn new(points: Vec<[f64; 3]>, colors: Option<Vec<[u8; 3]>>) -> Self {
        Self::from_parts(points, colors, None)
    }

    /// Create a point cloud carrying an intensity channel.
    pub fn with_intensities(points: Vec<[f64; 3]>, intensities: Vec<f32>) -> Self {
        Self::from_parts(points, None, Some(intensities))
    }

    /// Create a point cloud from all of its channels.
    ///
    /// Channels whose length differs from the number of points are dropped with a warning.
    pub fn from_parts(
        points: Vec<[f64; 3]>,
        colors: Option<Vec<[u8; 3]>>,
        intensities: Option<Vec<f32>>,
    ) -> Self {
        let colors = aligned_channel("colors", colors, points.len());
        let intensities = aligned_channel("intensities", intensities, points.len());
        Self {
            points,
            colors,
            intensities,
        }
    }

    /// Get the number of points in the point cloud.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the point cloud is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Get as reference the points in the point cloud.
    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    /// Get as reference the colors of the points in the point cloud.
    pub fn colors(&self) -> Option<&[[u8; 3]]> {
        self.colors.as_deref()
    }

    /// Get as reference the intensities of the points in the point cloud.
    pub fn intensities(&self) -> Option<&[f32]> {
        self.intensities.as_deref()
    }

    /// Get the minimum bound of the point cloud.
    pub fn min_bound(&self) -> DVec3 {
        self.points
            .iter()
            .map(|p| DVec3::from_array(*p))
            .reduce(|a, b| a.min(b))
            .unwrap_or(DVec3::ZERO)
    }

    /// Get the maximum bound of the point cloud.
    pub fn max_bound(&self) -> DVec3 {
        self.points
            .iter()
            .map(|p| DVec3::from_array(*p))
            .reduce(|a, b| a.max(b))
            .unwrap_or(DVec3::ZERO)
    }

    /// Mean of the points, `None` for an empty cloud.
    pub fn centroid(&self) -> Option<DVec3> {
        if self.points.is_empty() {
            return None;
        }
        let sum = self
            .points
            .iter()
            .fold(DVec3::ZERO, |acc, p| acc + DVec3::from_array(*p));
        Some(sum / self.points.len() as f64)
    }

    /// New cloud with the points at `indices`, keeping the per-point channels aligned.
    ///
    /// PRECONDITION: every index is in bounds.
    pub fn select(&self, indices: &[usize]) -> PointCloud {
        PointCloud {
            points: indices.iter().map(|&i| self.points[i]).collect(),
            colors: self
                .colors
                .as_ref()
                .map(|c| indices.iter().map(|&i| c[i]).collect()),
            intensities: self
                .intensities
                .as_ref()
                .map(|v| indices.iter().map(|&i| v[i]).collect()),
        }
    }

    /// New cloud with the points for which `keep` returns true.
    pub fn filter<F>(&self, mut keep: F) -> PointCloud
    where
        F: FnMut(usize, &[f64; 3]) -> bool,
    {
        let indices = self
            .points
            .iter()
            .enumerate()
            .filter(|(i, p)| keep(*i, p))
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        self.select(&indices)
    }

    /// New cloud with every point mapped through `transform`.
    pub fn transformed(&self, transform: &Transform) -> PointCloud {
        let mut points = vec![[0.0; 3]; self.points.len()];
        transform.transform_points(&self.points, &mut points);
        PointCloud {
            points,
            colors: self.colors.clone(),
            intensities: self.intensities.clone(),
        }
    }

    /// New cloud sharing the channels of `self` with replaced point coordinates.
    ///
    /// PRECONDITION: `points` has the same length as the cloud.
    pub fn with_points(&self, points: Vec<[f64; 3]>) -> PointCloud {
        assert_eq!(points.len(), self.points.len());
        PointCloud {
            points,
            colors: self.colors.clone(),
            intensities: self.intensities.clone(),
        }
    }
}

fn aligned_channel<T>(name: &str, channel: Option<Vec<T>>, len: usize) -> Option<Vec<T>> {
    match channel {
        Some(values) if values.len() != len => {
            log::warn!(
                "dropping {name}: {} values for {len} points",
                values.len()
            );
            None
        }
        channel => channel,
    }
}
