use glam::{DMat3, DMat4, DVec3, DVec4};
use serde::{Deserialize, Serialize};

/// Error types for the transform constructors.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TransformError {
    /// The rotation axis has (near) zero length.
    #[error("cannot compute a rotation from a zero axis")]
    ZeroAxis,

    /// The transform matrix is not invertible.
    #[error("transform is singular (determinant {0})")]
    Singular(f64),
}

/// One of the three coordinate axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// The x axis.
    X,
    /// The y axis.
    Y,
    /// The z axis.
    Z,
}

impl Axis {
    /// Index of the axis in a `[x, y, z]` array.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    /// Unit vector along the axis.
    pub fn unit(self) -> DVec3 {
        match self {
            Axis::X => DVec3::X,
            Axis::Y => DVec3::Y,
            Axis::Z => DVec3::Z,
        }
    }

    /// The axis `v` points most closely along, ignoring the sign. Ties go to the
    /// earlier axis.
    pub fn dominant(v: DVec3) -> Axis {
        let a = v.abs();
        if a.x >= a.y && a.x >= a.z {
            Axis::X
        } else if a.y >= a.z {
            Axis::Y
        } else {
            Axis::Z
        }
    }
}

/// Compute the rotation matrix from an axis and angle.
///
/// The axis does not need to be normalized.
///
/// # Arguments
///
/// * `axis` - The axis of rotation.
/// * `angle` - The angle of rotation in radians.
///
/// Example:
///
/// ```
/// use objpose_3d::transforms::axis_angle_to_rotation_matrix;
///
/// let rotation = axis_angle_to_rotation_matrix(&[1.0, 0.0, 0.0], std::f64::consts::FRAC_PI_2).unwrap();
/// assert!((rotation.y_axis.z - 1.0).abs() < 1e-12);
/// ```
pub fn axis_angle_to_rotation_matrix(axis: &[f64; 3], angle: f64) -> Result<DMat3, TransformError> {
    let axis = DVec3::from_array(*axis);
    let magnitude = axis.length();
    if magnitude < 1e-10 {
        return Err(TransformError::ZeroAxis);
    }
    Ok(DMat3::from_axis_angle(axis / magnitude, angle))
}

/// Rotation taking the unit vector `from` onto the unit vector `to` along the shortest arc.
pub fn rotation_between(from: DVec3, to: DVec3) -> DMat3 {
    let (from, to) = (from.normalize(), to.normalize());
    let cos = from.dot(to).clamp(-1.0, 1.0);
    let axis = from.cross(to);
    let sin = axis.length();
    if sin < 1e-12 {
        if cos > 0.0 {
            return DMat3::IDENTITY;
        }
        // antiparallel: any axis perpendicular to `from` works
        let ortho = if from.x.abs() < 0.9 { DVec3::X } else { DVec3::Y };
        return DMat3::from_axis_angle(from.cross(ortho).normalize(), std::f64::consts::PI);
    }
    DMat3::from_axis_angle(axis / sin, sin.atan2(cos))
}

/// A 4x4 homogeneous transform.
///
/// The naming convention follows `dst_T_src`: a transform maps points expressed in the
/// source frame into the destination frame. The rotation block is orthonormal unless a
/// scale was explicitly folded in with [`Transform::with_scale`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    matrix: DMat4,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    /// The identity transform.
    pub const IDENTITY: Self = Self {
        matrix: DMat4::IDENTITY,
    };

    /// Create a transform from a raw 4x4 matrix.
    pub fn from_matrix(matrix: DMat4) -> Self {
        Self { matrix }
    }

    /// Create a transform from row-major 4x4 data.
    pub fn from_rows(rows: &[[f64; 4]; 4]) -> Self {
        Self {
            matrix: DMat4::from_cols_array_2d(rows).transpose(),
        }
    }

    /// Create a rigid transform from a rotation and translation.
    pub fn from_rotation_translation(rotation: DMat3, translation: DVec3) -> Self {
        Self {
            matrix: DMat4::from_cols(
                rotation.x_axis.extend(0.0),
                rotation.y_axis.extend(0.0),
                rotation.z_axis.extend(0.0),
                translation.extend(1.0),
            ),
        }
    }

    /// Pure translation.
    pub fn from_translation(translation: DVec3) -> Self {
        Self::from_rotation_translation(DMat3::IDENTITY, translation)
    }

    /// Pure rotation about `axis` by `angle` radians.
    pub fn from_axis_angle(axis: &[f64; 3], angle: f64) -> Result<Self, TransformError> {
        let rotation = axis_angle_to_rotation_matrix(axis, angle)?;
        Ok(Self::from_rotation_translation(rotation, DVec3::ZERO))
    }

    /// Pure rotation about the z axis.
    pub fn from_rotation_z(angle: f64) -> Self {
        Self::from_rotation_translation(DMat3::from_rotation_z(angle), DVec3::ZERO)
    }

    /// Rotation about the vertical axis through `pivot`.
    pub fn rotation_z_about(angle: f64, pivot: DVec3) -> Self {
        Self::from_translation(pivot)
            .compose(&Self::from_rotation_z(angle))
            .compose(&Self::from_translation(-pivot))
    }

    /// Rotation from roll, pitch, yaw (radians) applied as `Rz(yaw) * Ry(pitch) * Rx(roll)`.
    pub fn from_euler(roll: f64, pitch: f64, yaw: f64) -> Self {
        let rotation =
            DMat3::from_rotation_z(yaw) * DMat3::from_rotation_y(pitch) * DMat3::from_rotation_x(roll);
        Self::from_rotation_translation(rotation, DVec3::ZERO)
    }

    /// Fold an anisotropic scale into the transform, applied before the rigid part.
    pub fn with_scale(&self, scale: DVec3) -> Self {
        Self {
            matrix: self.matrix * DMat4::from_scale(scale),
        }
    }

    /// Matrix product `self * other`: apply `other` first, then `self`.
    #[inline]
    pub fn compose(&self, other: &Transform) -> Self {
        Self {
            matrix: self.matrix * other.matrix,
        }
    }

    /// Inverse of the transform.
    ///
    /// Rigid transforms use the closed form `[R^T, -R^T t; 0, 1]`; transforms carrying a
    /// scale fall back to a general inverse.
    pub fn inverse(&self) -> Result<Self, TransformError> {
        if self.is_rigid(1e-9) {
            let rotation_t = self.rotation().transpose();
            let translation = -(rotation_t * self.translation());
            return Ok(Self::from_rotation_translation(rotation_t, translation));
        }
        let det = self.matrix.determinant();
        if det.abs() < 1e-12 {
            return Err(TransformError::Singular(det));
        }
        Ok(Self {
            matrix: self.matrix.inverse(),
        })
    }

    /// Whether the rotation block is orthonormal with a positive determinant.
    pub fn is_rigid(&self, tolerance: f64) -> bool {
        let rotation = self.rotation();
        let gram = rotation.transpose() * rotation;
        let bottom = self.matrix.row(3);
        gram.abs_diff_eq(DMat3::IDENTITY, tolerance)
            && (rotation.determinant() - 1.0).abs() < tolerance
            && bottom.abs_diff_eq(DVec4::W, tolerance)
    }

    /// The upper-left 3x3 block.
    pub fn rotation(&self) -> DMat3 {
        DMat3::from_mat4(self.matrix)
    }

    /// The translation column.
    pub fn translation(&self) -> DVec3 {
        self.matrix.w_axis.truncate()
    }

    /// The underlying matrix.
    pub fn matrix(&self) -> &DMat4 {
        &self.matrix
    }

    /// Row-major copy of the matrix.
    pub fn to_rows(&self) -> [[f64; 4]; 4] {
        self.matrix.transpose().to_cols_array_2d()
    }

    /// Replace the translation column.
    pub fn with_translation(&self, translation: DVec3) -> Self {
        let mut matrix = self.matrix;
        matrix.w_axis = translation.extend(1.0);
        Self { matrix }
    }

    /// Transform a single point.
    #[inline]
    pub fn transform_point(&self, point: &[f64; 3]) -> [f64; 3] {
        self.matrix
            .transform_point3(DVec3::from_array(*point))
            .to_array()
    }

    /// Transform a set of points into a pre-allocated buffer.
    ///
    /// PRECONDITION: `dst_points` has the same length as `src_points`.
    pub fn transform_points(&self, src_points: &[[f64; 3]], dst_points: &mut [[f64; 3]]) {
        assert_eq!(src_points.len(), dst_points.len());
        for (src, dst) in src_points.iter().zip(dst_points.iter_mut()) {
            *dst = self.transform_point(src);
        }
    }

    /// Rotation angle about the z axis, in radians.
    pub fn yaw(&self) -> f64 {
        let r = self.rotation();
        r.x_axis.y.atan2(r.x_axis.x)
    }

    /// Roll, pitch and yaw (radians) such that `R = Rz(yaw) * Ry(pitch) * Rx(roll)`.
    pub fn euler_angles(&self) -> [f64; 3] {
        let r = self.rotation();
        // column-major: r.x_axis = first column
        let r20 = r.x_axis.z;
        let r21 = r.y_axis.z;
        let r22 = r.z_axis.z;
        let pitch = (-r20).clamp(-1.0, 1.0).asin();
        if r20.abs() < 1.0 - 1e-9 {
            [r21.atan2(r22), pitch, r.x_axis.y.atan2(r.x_axis.x)]
        } else {
            // gimbal lock, fold the roll into the yaw
            [0.0, pitch, (-r.y_axis.x).atan2(r.y_axis.y)]
        }
    }

    /// Element-wise comparison with an absolute tolerance.
    pub fn approx_eq(&self, other: &Transform, tolerance: f64) -> bool {
        self.matrix.abs_diff_eq(other.matrix, tolerance)
    }
}

impl std::ops::Mul for Transform {
    type Output = Transform;

    fn mul(self, rhs: Transform) -> Transform {
        self.compose(&rhs)
    }
}
