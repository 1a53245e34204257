use glam::{DMat3, DVec3};
use objpose_3d::transforms::Transform;
use serde::{Deserialize, Serialize};

/// Subset of the six rigid-body parameters the registration may change.
///
/// The parameters are ordered `[tx, ty, tz, rx, ry, rz]`, with the rotations about the
/// axes of the target frame. Excluded parameters stay exactly zero in every update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DofMask {
    /// All six parameters.
    #[default]
    Free,
    /// Everything but the rotation about the vertical axis.
    NoAzimuth,
    /// Translation only.
    NoRotation,
    /// Translation and the rotation about the vertical axis.
    NoRollPitch,
    /// Translation in the horizontal plane only.
    TranslateXy,
}

impl DofMask {
    /// Indices of the parameters the mask leaves free.
    pub fn free_indices(self) -> &'static [usize] {
        match self {
            DofMask::Free => &[0, 1, 2, 3, 4, 5],
            DofMask::NoAzimuth => &[0, 1, 2, 3, 4],
            DofMask::NoRotation => &[0, 1, 2],
            DofMask::NoRollPitch => &[0, 1, 2, 5],
            DofMask::TranslateXy => &[0, 1],
        }
    }

    /// Whether parameter `dof` may change.
    pub fn allows(self, dof: usize) -> bool {
        self.free_indices().contains(&dof)
    }

    /// Zero every parameter the mask excludes.
    pub fn project(self, params: &mut [f64; 6]) {
        for (i, p) in params.iter_mut().enumerate() {
            if !self.allows(i) {
                *p = 0.0;
            }
        }
    }
}

/// A small rigid update linearized about `pivot`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PoseDelta {
    pub params: [f64; 6],
    pub pivot: DVec3,
}

impl PoseDelta {
    /// Euclidean norm of the parameter vector.
    pub fn magnitude(&self) -> f64 {
        self.params.iter().map(|p| p * p).sum::<f64>().sqrt()
    }

    /// The update as a transform: rotate about `pivot`, then translate.
    pub fn to_transform(&self) -> Transform {
        let [tx, ty, tz, rx, ry, rz] = self.params;
        let rotation = delta_rotation(DVec3::new(rx, ry, rz));
        let translation = DVec3::new(tx, ty, tz) + (self.pivot - rotation * self.pivot);
        Transform::from_rotation_translation(rotation, translation)
    }
}

// A zero vector gives the exact identity, a vertical-only vector an exact yaw.
fn delta_rotation(omega: DVec3) -> DMat3 {
    if omega == DVec3::ZERO {
        return DMat3::IDENTITY;
    }
    if omega.x == 0.0 && omega.y == 0.0 {
        return DMat3::from_rotation_z(omega.z);
    }
    let angle = omega.length();
    DMat3::from_axis_angle(omega / angle, angle)
}
