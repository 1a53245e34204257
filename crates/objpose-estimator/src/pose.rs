use objpose_3d::transforms::Transform;
use serde::{Deserialize, Serialize};

use crate::frames::PoseFrame;

/// Final pose of the object, ready to be persisted by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPose {
    /// Frame the pose is expressed in.
    pub frame: PoseFrame,
    /// Row-major rigid transform from the object frame to `frame`.
    pub transform: [[f64; 4]; 4],
    /// Translation part of `transform`.
    pub translation: [f64; 3],
    /// Roll, pitch and yaw in degrees, with `R = Rz(yaw) * Ry(pitch) * Rx(roll)`.
    pub rpy_deg: [f64; 3],
    /// Scale applied to the model before the rigid transform.
    pub scale: f64,
    /// Fitness of the registration that produced the pose.
    pub fitness: f64,
}

impl ObjectPose {
    /// Describe `transform` in `frame`.
    pub fn new(frame: PoseFrame, transform: &Transform, scale: f64, fitness: f64) -> Self {
        let [roll, pitch, yaw] = transform.euler_angles();
        Self {
            frame,
            transform: transform.to_rows(),
            translation: transform.translation().to_array(),
            rpy_deg: [roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees()],
            scale,
            fitness,
        }
    }

    /// The pose as a transform.
    pub fn to_transform(&self) -> Transform {
        Transform::from_rows(&self.transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::DVec3;

    #[test]
    fn test_object_pose() {
        let transform = Transform::from_euler(0.1, -0.2, 0.7).with_translation(DVec3::new(1.0, 2.0, 3.0));
        let pose = ObjectPose::new(PoseFrame::Base, &transform, 1.5, 1e-5);
        assert_eq!(pose.translation, [1.0, 2.0, 3.0]);
        assert_relative_eq!(pose.rpy_deg[0], 0.1f64.to_degrees(), epsilon = 1e-9);
        assert_relative_eq!(pose.rpy_deg[1], -0.2f64.to_degrees(), epsilon = 1e-9);
        assert_relative_eq!(pose.rpy_deg[2], 0.7f64.to_degrees(), epsilon = 1e-9);
        assert!(pose.to_transform().approx_eq(&transform, 1e-15));
    }

    #[test]
    fn test_object_pose_serializes() -> Result<(), Box<dyn std::error::Error>> {
        let pose = ObjectPose::new(PoseFrame::Fixture, &Transform::IDENTITY, 1.0, 0.0);
        let json = serde_json::to_value(&pose)?;
        assert_eq!(json["frame"], "fixture");
        assert_eq!(json["scale"], 1.0);
        assert_eq!(json["transform"][3][3], 1.0);
        Ok(())
    }
}
