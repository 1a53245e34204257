use glam::DVec3;
use objpose_3d::{filters::ScanDistortion, plane::RansacParams, transforms::Axis};
use objpose_icp::{rotational_symmetries, AzimuthSearchParams, DofMask, RegistrationParams};
use serde::{Deserialize, Serialize};

use crate::error::PoseEstimatorError;

/// Configuration of a [`crate::PoseEstimator`].
///
/// Distances are in meters, angles in degrees. Missing fields take their default value
/// when deserializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseEstimatorConfig {
    /// Voxel size used to downsample the scene.
    pub scene_leaf_size: f64,
    /// Voxel size used to downsample the object model.
    pub object_leaf_size: f64,
    /// Side lengths of the scene crop box.
    pub box_size: [f64; 3],
    /// Offset of the crop box center from the object init position.
    pub box_offset: [f64; 3],
    /// Rough position of the object in the camera frame.
    pub object_init_position: [f64; 3],
    /// Initial rotation of the model about the vertical axis.
    pub object_init_azimuth_deg: f64,
    /// Roll, pitch and yaw turning the model upright before it is placed.
    pub object_flip_deg: [f64; 3],
    /// Translation of the placed model in the fixture frame.
    pub object_slide: [f64; 3],
    /// Vertical offset added to the final pose.
    pub height_adjust: f64,
    /// Axis the support plane normal must be close to, in the camera frame.
    pub reference_axis: [f64; 3],
    /// Maximum tilt of the support plane relative to `reference_axis`.
    pub plane_angle_tolerance_deg: f64,
    /// Inlier distance of the support plane fit.
    pub plane_inlier_threshold: f64,
    /// Maximum number of RANSAC hypotheses.
    pub ransac_max_iterations: usize,
    /// Seed of the RANSAC sampler, `None` for a random seed.
    pub ransac_seed: Option<u64>,
    /// Whether the scene carries line-scan skew.
    pub scene_distorted: bool,
    /// Sweep axis of the line-scan sensor.
    pub scan_axis: Axis,
    /// Keep only scene points whose color channels are all at least this value.
    pub color_threshold: Option<u8>,
    /// Axis along which the model is scaled to the scene.
    pub scale_axis: Option<Axis>,
    /// Fixed scale, overriding `scale_axis`.
    pub forced_scale: Option<f64>,
    /// Maximum number of ICP iterations.
    pub icp_max_iterations: usize,
    /// Maximum correspondence distance.
    pub icp_max_corr_distance: f64,
    /// Correspondences farther apart do not drive the update.
    pub icp_outlier_rejection_threshold: f64,
    /// Keep only mutual nearest neighbors.
    pub icp_reciprocal: bool,
    /// Update norm below which the registration has converged.
    pub icp_transformation_epsilon: f64,
    /// Restrict the registration to a horizontal translation.
    pub icp_only_xy: bool,
    /// Keep roll and pitch fixed.
    pub icp_no_rollpitch: bool,
    /// Explicit mask, overriding `icp_only_xy` and `icp_no_rollpitch`.
    pub icp_mask: Option<DofMask>,
    /// The object looks the same after a half turn about its vertical axis.
    pub icp_symmetric_object: bool,
    /// Order of the rotational symmetry, overriding `icp_symmetric_object`.
    pub icp_symmetry_order: Option<usize>,
    /// Full width of the azimuth sweep.
    pub azimuth_range_deg: f64,
    /// Angle between two azimuth candidates.
    pub azimuth_step_deg: f64,
    /// Stop the sweep once a trial reaches this fitness.
    pub azimuth_target_fitness: Option<f64>,
}

impl Default for PoseEstimatorConfig {
    fn default() -> Self {
        Self {
            scene_leaf_size: 0.005,
            object_leaf_size: 0.005,
            box_size: [0.3, 0.3, 0.3],
            box_offset: [0.0, 0.0, 0.15],
            object_init_position: [0.0, 0.0, 0.0],
            object_init_azimuth_deg: 0.0,
            object_flip_deg: [0.0, 0.0, 0.0],
            object_slide: [0.0, 0.0, 0.0],
            height_adjust: 0.0,
            reference_axis: [0.0, 0.0, 1.0],
            plane_angle_tolerance_deg: 20.0,
            plane_inlier_threshold: 0.003,
            ransac_max_iterations: 1000,
            ransac_seed: Some(0),
            scene_distorted: false,
            scan_axis: Axis::Y,
            color_threshold: None,
            scale_axis: None,
            forced_scale: None,
            icp_max_iterations: 100,
            icp_max_corr_distance: 0.05,
            icp_outlier_rejection_threshold: 0.01,
            icp_reciprocal: false,
            icp_transformation_epsilon: 1e-8,
            icp_only_xy: false,
            icp_no_rollpitch: true,
            icp_mask: None,
            icp_symmetric_object: false,
            icp_symmetry_order: None,
            azimuth_range_deg: 90.0,
            azimuth_step_deg: 5.0,
            azimuth_target_fitness: None,
        }
    }
}

fn positive(name: &str, value: f64) -> Result<(), PoseEstimatorError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(PoseEstimatorError::Configuration(format!(
            "{name} must be > 0, got {value}"
        )))
    }
}

impl PoseEstimatorConfig {
    /// Check that every value is in range.
    pub fn validate(&self) -> Result<(), PoseEstimatorError> {
        positive("scene_leaf_size", self.scene_leaf_size)?;
        positive("object_leaf_size", self.object_leaf_size)?;
        for (name, value) in ["box_size.x", "box_size.y", "box_size.z"]
            .iter()
            .zip(self.box_size)
        {
            positive(name, value)?;
        }
        if DVec3::from_array(self.reference_axis).length_squared() == 0.0 {
            return Err(PoseEstimatorError::Configuration(
                "reference_axis must be non-zero".to_string(),
            ));
        }
        positive("plane_inlier_threshold", self.plane_inlier_threshold)?;
        positive("icp_max_corr_distance", self.icp_max_corr_distance)?;
        positive(
            "icp_outlier_rejection_threshold",
            self.icp_outlier_rejection_threshold,
        )?;
        positive("azimuth_step_deg", self.azimuth_step_deg)?;
        if !(self.azimuth_range_deg >= 0.0) {
            return Err(PoseEstimatorError::Configuration(format!(
                "azimuth_range_deg must be >= 0, got {}",
                self.azimuth_range_deg
            )));
        }
        if let Some(scale) = self.forced_scale {
            positive("forced_scale", scale)?;
        }
        Ok(())
    }

    /// Center of the scene crop box in the camera frame.
    pub fn box_center(&self) -> DVec3 {
        DVec3::from_array(self.object_init_position) + DVec3::from_array(self.box_offset)
    }

    /// The degrees of freedom the registration may change.
    pub fn dof_mask(&self) -> DofMask {
        match self.icp_mask {
            Some(mask) => mask,
            None if self.icp_only_xy => DofMask::TranslateXy,
            None if self.icp_no_rollpitch => DofMask::NoRollPitch,
            None => DofMask::Free,
        }
    }

    /// Sampling parameters of the plane fits.
    pub fn ransac_params(&self) -> RansacParams {
        RansacParams {
            max_iterations: self.ransac_max_iterations,
            random_seed: self.ransac_seed,
            ..Default::default()
        }
    }

    /// Skew model of the scene.
    ///
    /// Heights are measured along the camera axis closest to `reference_axis`, and the
    /// support plane is fitted with the same tolerance and inlier distance as the main
    /// plane fit.
    pub fn scan_distortion(&self) -> ScanDistortion {
        ScanDistortion {
            distorted: self.scene_distorted,
            scan_axis: self.scan_axis,
            height_axis: Axis::dominant(DVec3::from_array(self.reference_axis)),
            angle_tolerance: self.plane_angle_tolerance_deg.to_radians(),
            inlier_threshold: self.plane_inlier_threshold,
            ransac: self.ransac_params(),
        }
    }

    /// Parameters of a single registration.
    pub fn registration_params(&self) -> RegistrationParams {
        let order = self
            .icp_symmetry_order
            .unwrap_or(if self.icp_symmetric_object { 2 } else { 1 });
        RegistrationParams {
            dof_mask: self.dof_mask(),
            max_iterations: self.icp_max_iterations,
            max_correspondence_distance: self.icp_max_corr_distance,
            outlier_rejection_threshold: self.icp_outlier_rejection_threshold,
            use_reciprocal_correspondences: self.icp_reciprocal,
            transformation_epsilon: self.icp_transformation_epsilon,
            symmetries: rotational_symmetries(order),
            ..Default::default()
        }
    }

    /// Parameters of the azimuth sweep, in radians.
    pub fn azimuth_search_params(&self) -> AzimuthSearchParams {
        AzimuthSearchParams {
            range: self.azimuth_range_deg.to_radians(),
            step: self.azimuth_step_deg.to_radians(),
            target_fitness: self.azimuth_target_fitness,
        }
    }
}
