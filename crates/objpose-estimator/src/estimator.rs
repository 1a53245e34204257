use std::fmt;

use glam::DVec3;
use kiddo::immutable::float::kdtree::ImmutableKdTree;
use objpose_3d::{
    filters::{crop_subsample, remove_distortion, CloudError},
    plane::{estimate_perpendicular_plane, extract_prism, PlaneModel},
    pointcloud::PointCloud,
    transforms::{rotation_between, Axis, Transform},
    voxel_grid::VoxelGrid,
};
use objpose_icp::{search_azimuth, AzimuthTrial, DofIcp, RegistrationParams, RegistrationResult};

use crate::config::PoseEstimatorConfig;
use crate::error::PoseEstimatorError;
use crate::frames::{FrameChain, PoseFrame};
use crate::pose::ObjectPose;

/// Processing stage of a [`PoseEstimator`], in the order the stages are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Nothing processed yet.
    Uninitialized,
    /// The scene is cropped, leveled and segmented.
    SceneProcessed,
    /// The model is downsampled, scaled and placed.
    ObjectProcessed,
    /// A registration has run.
    Registered,
    /// The final pose is composed.
    Finalized,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct SceneState {
    // cropped, downsampled and de-skewed, camera frame
    cropped: PointCloud,
    // support plane, camera frame
    plane: PlaneModel,
    // points above the plane, fixture frame
    processed: PointCloud,
}

struct ObjectState {
    // downsampled model, model frame
    model: PointCloud,
    // rigid part of the initial placement
    placement: Transform,
    scale: f64,
    // model at the initial placement, fixture frame
    placed: PointCloud,
}

struct Registration {
    result: RegistrationResult,
    azimuth: Option<f64>,
    trials: Vec<AzimuthTrial>,
}

/// Estimates the pose and scale of a known object model in a tabletop scene.
///
/// The estimator runs in stages: [`PoseEstimator::process_scene`],
/// [`PoseEstimator::process_object`], [`PoseEstimator::init_icp`], then
/// [`PoseEstimator::do_icp`] or [`PoseEstimator::do_auto_icp`], and finally
/// [`PoseEstimator::finalize`]. A failing stage leaves the estimator untouched; running a
/// stage again discards everything computed after it.
///
/// Registration happens in the fixture frame, whose z axis is the normal of the
/// support plane, so the degrees-of-freedom masks refer to that plane.
pub struct PoseEstimator {
    config: PoseEstimatorConfig,
    stage: Stage,
    scene: Option<PointCloud>,
    object: Option<PointCloud>,
    frames: FrameChain,
    scene_state: Option<SceneState>,
    object_state: Option<ObjectState>,
    icp_params: Option<RegistrationParams>,
    registration: Option<Registration>,
    segmented: Option<PointCloud>,
}

impl PoseEstimator {
    /// Create an estimator without clouds.
    pub fn new(config: PoseEstimatorConfig) -> Result<Self, PoseEstimatorError> {
        config.validate()?;
        Ok(Self {
            config,
            stage: Stage::Uninitialized,
            scene: None,
            object: None,
            frames: FrameChain::default(),
            scene_state: None,
            object_state: None,
            icp_params: None,
            registration: None,
            segmented: None,
        })
    }

    /// Create an estimator for a scene, in the camera frame, and an object model.
    pub fn with_clouds(
        config: PoseEstimatorConfig,
        scene: PointCloud,
        object: PointCloud,
    ) -> Result<Self, PoseEstimatorError> {
        let mut estimator = Self::new(config)?;
        estimator.scene = Some(scene);
        estimator.object = Some(object);
        Ok(estimator)
    }

    /// Replace the scene cloud. Everything processed so far is discarded.
    pub fn set_scene(&mut self, scene: PointCloud) {
        self.scene = Some(scene);
        self.reset_after(Stage::Uninitialized);
    }

    /// Replace the object model. The processed scene is kept.
    pub fn set_object(&mut self, object: PointCloud) {
        self.object = Some(object);
        self.reset_after(Stage::SceneProcessed);
    }

    /// The current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The configuration.
    pub fn config(&self) -> &PoseEstimatorConfig {
        &self.config
    }

    /// Replace the whole configuration. Takes effect at the next stage that runs.
    pub fn set_config(&mut self, config: PoseEstimatorConfig) -> Result<(), PoseEstimatorError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// The frame chain.
    pub fn frames(&self) -> &FrameChain {
        &self.frames
    }

    /// Set the pose of the base in the camera frame.
    pub fn set_camera_base(&mut self, c_t_b: Transform) {
        self.frames.set_camera_base(c_t_b);
    }

    /// Set the pose of the fixture (turntable) in the base frame.
    ///
    /// Returns false, leaving the offset untouched, once the offset is locked.
    pub fn set_fixture_pose(&mut self, b_t_f: Transform) -> bool {
        self.frames.set_fixture_offset(b_t_f)
    }

    /// Freeze the fixture offset. Later scenes are leveled with the stored offset.
    pub fn lock_fixture_offset(&mut self) {
        self.frames.lock_fixture_offset();
    }

    fn reset_after(&mut self, stage: Stage) {
        if stage < Stage::SceneProcessed {
            self.scene_state = None;
        }
        if stage < Stage::ObjectProcessed {
            self.object_state = None;
            self.icp_params = None;
        }
        if stage < Stage::Registered {
            self.registration = None;
        }
        self.segmented = None;
        self.frames.set_fixture_object(Transform::IDENTITY);
        self.stage = self.stage.min(stage);
    }

    fn require(&self, operation: &'static str, minimum: Stage) -> Result<(), PoseEstimatorError> {
        if self.stage < minimum {
            return Err(self.invalid(operation));
        }
        Ok(())
    }

    fn invalid(&self, operation: &'static str) -> PoseEstimatorError {
        PoseEstimatorError::InvalidState {
            operation,
            stage: self.stage,
        }
    }

    /// Crop, de-skew and downsample the scene, fit the support plane and segment what
    /// stands on it.
    ///
    /// The fixture frame is placed on the plane below the object init position. Unless
    /// the fixture offset is locked, the base to fixture transform is updated from it.
    pub fn process_scene(&mut self) -> Result<(), PoseEstimatorError> {
        self.config.validate()?;
        let scene = self
            .scene
            .as_ref()
            .ok_or(PoseEstimatorError::MissingCloud("scene"))?;
        let config = &self.config;

        let undistorted = remove_distortion(scene, &config.scan_distortion())?;
        let box_size = DVec3::from_array(config.box_size);
        let cropped = crop_subsample(
            &undistorted,
            config.box_center(),
            box_size,
            config.scene_leaf_size,
        )?;

        let fit = estimate_perpendicular_plane(
            &cropped,
            DVec3::from_array(config.reference_axis),
            config.plane_angle_tolerance_deg.to_radians(),
            config.plane_inlier_threshold,
            &config.ransac_params(),
        )?;
        let plane = fit.model;

        let locked = self.frames.fixture_offset().is_locked();
        let c_t_f = if locked {
            self.frames.camera_fixture()
        } else {
            let origin = DVec3::from_array(plane.project(&config.object_init_position));
            Transform::from_rotation_translation(rotation_between(DVec3::Z, plane.normal()), origin)
        };
        let f_t_c = c_t_f.inverse()?;
        let b_t_f = self.frames.camera_base().inverse()? * c_t_f;

        let prism = extract_prism(&cropped, &plane, config.plane_inlier_threshold, box_size.z);
        let above = cropped.select(&prism).transformed(&f_t_c);
        let processed = match (config.color_threshold, above.colors()) {
            (Some(threshold), Some(colors)) => {
                above.filter(|i, _| colors[i].iter().all(|&c| c >= threshold))
            }
            (Some(threshold), None) => {
                log::warn!("color threshold {threshold} ignored: the scene has no colors");
                above.clone()
            }
            (None, _) => above.clone(),
        };
        if processed.is_empty() {
            return Err(CloudError::EmptyResult.into());
        }

        log::info!(
            "scene processed: {} cropped points, plane {:?}, {} points above it",
            cropped.len(),
            plane.coefficients(),
            processed.len()
        );

        if !locked {
            self.frames.set_fixture_offset(b_t_f);
        }
        self.scene_state = Some(SceneState {
            cropped,
            plane,
            processed,
        });
        self.stage = Stage::SceneProcessed;
        self.reset_after(Stage::SceneProcessed);
        Ok(())
    }

    /// Downsample the model, turn it upright, scale it and place it on the fixture.
    ///
    /// The upright model is moved so that its horizontal centroid is at the fixture
    /// origin and its lowest point on the plane, then turned by the init azimuth and
    /// shifted by the slide.
    pub fn process_object(&mut self) -> Result<(), PoseEstimatorError> {
        self.require("process_object", Stage::SceneProcessed)?;
        self.config.validate()?;
        let object = self
            .object
            .as_ref()
            .ok_or(PoseEstimatorError::MissingCloud("object"))?;
        let scene = self
            .scene_state
            .as_ref()
            .ok_or_else(|| self.invalid("process_object"))?;
        let config = &self.config;

        let model = VoxelGrid::uniform(config.object_leaf_size)?.downsample(object);
        if model.is_empty() {
            return Err(CloudError::EmptyResult.into());
        }
        let [roll, pitch, yaw] = config.object_flip_deg.map(f64::to_radians);
        let flip = Transform::from_euler(roll, pitch, yaw);
        let scale = estimate_scale(config, &model.transformed(&flip), &scene.processed);

        let upright = model.transformed(&flip.with_scale(DVec3::splat(scale)));
        let centroid = upright.centroid().ok_or(CloudError::EmptyResult)?;
        let level = Transform::from_translation(DVec3::new(
            -centroid.x,
            -centroid.y,
            -upright.min_bound().z,
        ));
        let placement = Transform::from_translation(DVec3::from_array(config.object_slide))
            * Transform::from_rotation_z(config.object_init_azimuth_deg.to_radians())
            * level
            * flip;
        let placed = model.transformed(&placement.with_scale(DVec3::splat(scale)));

        log::info!(
            "object processed: {} -> {} points, scale {scale:.4}",
            object.len(),
            model.len()
        );

        self.object_state = Some(ObjectState {
            model,
            placement,
            scale,
            placed,
        });
        self.icp_params = None;
        self.stage = Stage::ObjectProcessed;
        self.reset_after(Stage::ObjectProcessed);
        Ok(())
    }

    /// Set up the registration from the current configuration flags.
    pub fn init_icp(&mut self) -> Result<(), PoseEstimatorError> {
        self.require("init_icp", Stage::ObjectProcessed)?;
        self.config.validate()?;
        let params = self.config.registration_params();
        log::info!(
            "icp initialized: mask {:?}, {} symmetry hypotheses",
            params.dof_mask,
            params.symmetries.len()
        );
        self.icp_params = Some(params);
        self.reset_after(Stage::ObjectProcessed);
        Ok(())
    }

    /// Register the placed model onto the segmented scene from the initial placement.
    ///
    /// Returns the fitness of the registration.
    pub fn do_icp(&mut self) -> Result<f64, PoseEstimatorError> {
        let result = {
            let (icp, source) = self.registrar("do_icp")?;
            icp.register_with_symmetries(source, &Transform::IDENTITY)?
        };
        self.store_registration(result, None, Vec::new())
    }

    /// Register the placed model from every candidate of the azimuth sweep and keep the
    /// best fit.
    ///
    /// Returns the fitness of the winning registration.
    pub fn do_auto_icp(&mut self) -> Result<f64, PoseEstimatorError> {
        let search = {
            let (icp, source) = self.registrar("do_auto_icp")?;
            search_azimuth(
                &icp,
                source,
                &Transform::IDENTITY,
                &self.config.azimuth_search_params(),
            )?
        };
        self.store_registration(search.result, Some(search.azimuth), search.trials)
    }

    fn registrar(&self, operation: &'static str) -> Result<(DofIcp<'_>, &PointCloud), PoseEstimatorError> {
        self.require(operation, Stage::ObjectProcessed)?;
        let (Some(params), Some(scene), Some(object)) = (
            self.icp_params.as_ref(),
            self.scene_state.as_ref(),
            self.object_state.as_ref(),
        ) else {
            return Err(self.invalid(operation));
        };
        let icp = DofIcp::new(&scene.processed, params.clone())?;
        Ok((icp, &object.placed))
    }

    fn store_registration(
        &mut self,
        result: RegistrationResult,
        azimuth: Option<f64>,
        trials: Vec<AzimuthTrial>,
    ) -> Result<f64, PoseEstimatorError> {
        if !result.converged {
            log::warn!(
                "registration did not converge after {} iterations",
                result.num_iterations
            );
        }
        let fitness = result.fitness;
        self.registration = Some(Registration {
            result,
            azimuth,
            trials,
        });
        self.stage = Stage::Registered;
        self.reset_after(Stage::Registered);
        Ok(fitness)
    }

    /// Compose the final pose `T(0, 0, height_adjust) * T_icp * placement` and segment the
    /// scene points the registered model explains.
    ///
    /// Returns the pose in the fixture frame.
    pub fn finalize(&mut self) -> Result<ObjectPose, PoseEstimatorError> {
        self.require("finalize", Stage::Registered)?;
        let (Some(registration), Some(scene), Some(object)) = (
            self.registration.as_ref(),
            self.scene_state.as_ref(),
            self.object_state.as_ref(),
        ) else {
            return Err(self.invalid("finalize"));
        };

        let icp = registration.result.transform;
        let f_t_o = Transform::from_translation(DVec3::new(0.0, 0.0, self.config.height_adjust))
            * icp
            * object.placement;
        let segmented = points_near(
            &scene.processed,
            &object.placed.transformed(&icp),
            self.config.icp_max_corr_distance,
        );

        log::info!(
            "pose finalized: {} of {} scene points explained by the model",
            segmented.len(),
            scene.processed.len()
        );

        self.frames.set_fixture_object(f_t_o);
        self.segmented = Some(segmented);
        self.stage = Stage::Finalized;
        self.object_pose_in(PoseFrame::Fixture)
    }

    /// The final pose in `frame`.
    pub fn object_pose_in(&self, frame: PoseFrame) -> Result<ObjectPose, PoseEstimatorError> {
        self.require("object_pose_in", Stage::Finalized)?;
        let (Some(registration), Some(object)) =
            (self.registration.as_ref(), self.object_state.as_ref())
        else {
            return Err(self.invalid("object_pose_in"));
        };
        Ok(ObjectPose::new(
            frame,
            &self.frames.object_in(frame),
            object.scale,
            registration.result.fitness,
        ))
    }

    /// The scene cloud, camera frame.
    pub fn scene(&self) -> Option<&PointCloud> {
        self.scene.as_ref()
    }

    /// The object model.
    pub fn object(&self) -> Option<&PointCloud> {
        self.object.as_ref()
    }

    /// Lower corner of the scene crop box, camera frame.
    pub fn scene_box_min_pt(&self) -> DVec3 {
        self.config.box_center() - DVec3::from_array(self.config.box_size) * 0.5
    }

    /// Upper corner of the scene crop box, camera frame.
    pub fn scene_box_max_pt(&self) -> DVec3 {
        self.config.box_center() + DVec3::from_array(self.config.box_size) * 0.5
    }

    /// The cropped and downsampled scene, camera frame.
    pub fn cropped_scene(&self) -> Option<&PointCloud> {
        self.scene_state.as_ref().map(|s| &s.cropped)
    }

    /// The scene points standing on the support plane, fixture frame.
    pub fn processed_scene(&self) -> Option<&PointCloud> {
        self.scene_state.as_ref().map(|s| &s.processed)
    }

    /// The support plane, camera frame.
    pub fn plane(&self) -> Option<&PlaneModel> {
        self.scene_state.as_ref().map(|s| &s.plane)
    }

    /// Coefficients `(a, b, c, d)` of the support plane, camera frame.
    pub fn plane_coefficients(&self) -> Option<[f64; 4]> {
        self.plane().map(PlaneModel::coefficients)
    }

    /// Convex hull of the support plane inliers, camera frame.
    pub fn plane_hull(&self) -> Option<&[[f64; 3]]> {
        self.plane().map(PlaneModel::hull)
    }

    /// The model at its current pose in the fixture frame: the initial placement, the
    /// registered pose, or the final pose once finalized.
    pub fn processed_object(&self) -> Option<PointCloud> {
        let object = self.object_state.as_ref()?;
        match (self.stage, self.registration.as_ref()) {
            (Stage::Finalized, _) => Some(object.model.transformed(
                &self
                    .frames
                    .fixture_object()
                    .with_scale(DVec3::splat(object.scale)),
            )),
            (_, Some(registration)) => {
                Some(object.placed.transformed(&registration.result.transform))
            }
            _ => Some(object.placed.clone()),
        }
    }

    /// The scene points explained by the registered model, fixture frame.
    pub fn segmented_object(&self) -> Option<&PointCloud> {
        self.segmented.as_ref()
    }

    /// Scale applied to the model.
    pub fn scale(&self) -> Option<f64> {
        self.object_state.as_ref().map(|o| o.scale)
    }

    /// The last registration.
    pub fn registration_result(&self) -> Option<&RegistrationResult> {
        self.registration.as_ref().map(|r| &r.result)
    }

    /// The transform found by the last registration, `T_icp`.
    pub fn icp_transform(&self) -> Option<Transform> {
        self.registration_result().map(|r| r.transform)
    }

    /// Winning azimuth offset of the last sweep, in radians.
    pub fn best_azimuth(&self) -> Option<f64> {
        self.registration.as_ref().and_then(|r| r.azimuth)
    }

    /// Trials of the last sweep.
    pub fn azimuth_trials(&self) -> &[AzimuthTrial] {
        self.registration
            .as_ref()
            .map(|r| r.trials.as_slice())
            .unwrap_or_default()
    }

    /// Set the scene voxel size.
    pub fn set_scene_leaf_size(&mut self, leaf_size: f64) {
        self.config.scene_leaf_size = leaf_size;
    }

    /// Set the object voxel size.
    pub fn set_object_leaf_size(&mut self, leaf_size: f64) {
        self.config.object_leaf_size = leaf_size;
    }

    /// Set the side lengths of the scene crop box.
    pub fn set_box_size(&mut self, size: [f64; 3]) {
        self.config.box_size = size;
    }

    /// Set the offset of the crop box center from the init position.
    pub fn set_box_offset(&mut self, offset: [f64; 3]) {
        self.config.box_offset = offset;
    }

    /// Set whether the scene carries line-scan skew.
    pub fn set_scene_distorted(&mut self, distorted: bool) {
        self.config.scene_distorted = distorted;
    }

    /// Set the rough object position, camera frame.
    pub fn set_object_init_position(&mut self, position: [f64; 3]) {
        self.config.object_init_position = position;
    }

    /// Set the initial model azimuth in degrees.
    pub fn set_object_init_azimuth_deg(&mut self, azimuth: f64) {
        self.config.object_init_azimuth_deg = azimuth;
    }

    /// Set the roll, pitch and yaw, in degrees, that turn the model upright.
    pub fn set_object_flip_angles(&mut self, roll: f64, pitch: f64, yaw: f64) {
        self.config.object_flip_deg = [roll, pitch, yaw];
    }

    /// Set the translation of the placed model, fixture frame.
    pub fn set_object_slide(&mut self, slide: [f64; 3]) {
        self.config.object_slide = slide;
    }

    /// Set the vertical offset added to the final pose.
    pub fn set_height_adjust(&mut self, height: f64) {
        self.config.height_adjust = height;
    }

    /// Set the axis the model is scaled along, `None` to keep the model size.
    pub fn set_scale_axis(&mut self, axis: Option<Axis>) {
        self.config.scale_axis = axis;
    }

    /// Set a fixed model scale, `None` to estimate it.
    pub fn set_forced_scale(&mut self, scale: Option<f64>) {
        self.config.forced_scale = scale;
    }

    /// Set the maximum correspondence distance.
    pub fn set_icp_max_corr_distance(&mut self, distance: f64) {
        self.config.icp_max_corr_distance = distance;
    }

    /// Set the outlier rejection distance.
    pub fn set_icp_outlier_rejection_threshold(&mut self, distance: f64) {
        self.config.icp_outlier_rejection_threshold = distance;
    }

    /// Set whether correspondences must be mutual.
    pub fn set_icp_reciprocal(&mut self, reciprocal: bool) {
        self.config.icp_reciprocal = reciprocal;
    }

    /// Set whether roll and pitch stay fixed.
    pub fn set_icp_no_rollpitch(&mut self, no_rollpitch: bool) {
        self.config.icp_no_rollpitch = no_rollpitch;
    }

    /// Set whether only the horizontal translation may change.
    pub fn set_icp_only_xy(&mut self, only_xy: bool) {
        self.config.icp_only_xy = only_xy;
    }

    /// Set whether the object looks the same after a half turn.
    pub fn set_icp_symmetric_object(&mut self, symmetric: bool) {
        self.config.icp_symmetric_object = symmetric;
    }

    /// Set the full width of the azimuth sweep in degrees.
    pub fn set_azimuth_search_range_deg(&mut self, range: f64) {
        self.config.azimuth_range_deg = range;
    }

    /// Set the azimuth sweep step in degrees.
    pub fn set_azimuth_search_step_deg(&mut self, step: f64) {
        self.config.azimuth_step_deg = step;
    }
}

// A forced scale wins over the axis estimate.
fn estimate_scale(config: &PoseEstimatorConfig, upright: &PointCloud, scene: &PointCloud) -> f64 {
    if let Some(scale) = config.forced_scale {
        return scale;
    }
    let Some(axis) = config.scale_axis else {
        return 1.0;
    };
    let i = axis.index();
    let model_extent = upright.max_bound()[i] - upright.min_bound()[i];
    // heights are measured from the plane, other extents across the segmented scene
    let scene_extent = match axis {
        Axis::Z => scene.max_bound().z,
        _ => scene.max_bound()[i] - scene.min_bound()[i],
    };
    if !(model_extent > 0.0 && scene_extent > 0.0) {
        log::warn!(
            "cannot estimate scale along {axis:?} (model {model_extent}, scene {scene_extent}), using 1"
        );
        return 1.0;
    }
    scene_extent / model_extent
}

fn points_near(cloud: &PointCloud, reference: &PointCloud, max_distance: f64) -> PointCloud {
    if reference.is_empty() {
        return PointCloud::default();
    }
    let kdtree: ImmutableKdTree<f64, u32, 3, 32> =
        ImmutableKdTree::new_from_slice(reference.points());
    let max_sq = max_distance * max_distance;
    cloud.filter(|_, p| kdtree.nearest_one::<kiddo::SquaredEuclidean>(p).distance <= max_sq)
}
