use objpose_3d::transforms::Transform;
use serde::{Deserialize, Serialize};

/// Frame in which a pose is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoseFrame {
    /// The fixture frame: origin on the support plane, z along its normal.
    Fixture,
    /// The robot or turntable base frame.
    Base,
    /// The sensor frame the scene was captured in.
    Camera,
}

/// Pose of the fixture in the base frame, writable until locked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixtureOffset {
    /// Updated from every processed scene.
    Unlocked(Transform),
    /// Captured reference pose; writes are ignored.
    Locked(Transform),
}

impl FixtureOffset {
    /// The stored `T_b_f`.
    pub fn transform(&self) -> &Transform {
        match self {
            FixtureOffset::Unlocked(t) | FixtureOffset::Locked(t) => t,
        }
    }

    /// Whether the offset is locked.
    pub fn is_locked(&self) -> bool {
        matches!(self, FixtureOffset::Locked(_))
    }

    /// Replace the offset if it is unlocked. Returns whether it was written.
    pub fn set(&mut self, b_t_f: Transform) -> bool {
        match self {
            FixtureOffset::Unlocked(t) => {
                *t = b_t_f;
                true
            }
            FixtureOffset::Locked(_) => {
                log::warn!("fixture offset is locked, ignoring the new value");
                false
            }
        }
    }

    /// Freeze the current offset.
    pub fn lock(&mut self) {
        *self = FixtureOffset::Locked(*self.transform());
    }
}

impl Default for FixtureOffset {
    fn default() -> Self {
        FixtureOffset::Unlocked(Transform::IDENTITY)
    }
}

/// The chain camera -> base -> fixture -> object.
///
/// Transforms are named `x_T_y`, mapping points from frame `y` to frame `x`.
#[derive(Debug, Clone, Default)]
pub struct FrameChain {
    c_t_b: Transform,
    b_t_f: FixtureOffset,
    f_t_o: Transform,
}

impl FrameChain {
    /// Pose of the base in the camera frame.
    pub fn camera_base(&self) -> &Transform {
        &self.c_t_b
    }

    /// Set the pose of the base in the camera frame.
    pub fn set_camera_base(&mut self, c_t_b: Transform) {
        self.c_t_b = c_t_b;
    }

    /// Pose of the fixture in the base frame.
    pub fn fixture_offset(&self) -> &FixtureOffset {
        &self.b_t_f
    }

    /// Set the pose of the fixture in the base frame. Ignored once locked.
    pub fn set_fixture_offset(&mut self, b_t_f: Transform) -> bool {
        self.b_t_f.set(b_t_f)
    }

    /// Freeze the fixture offset.
    pub fn lock_fixture_offset(&mut self) {
        self.b_t_f.lock();
    }

    /// Pose of the object in the fixture frame.
    pub fn fixture_object(&self) -> &Transform {
        &self.f_t_o
    }

    /// Set the pose of the object in the fixture frame.
    pub fn set_fixture_object(&mut self, f_t_o: Transform) {
        self.f_t_o = f_t_o;
    }

    /// Pose of the fixture in the camera frame.
    pub fn camera_fixture(&self) -> Transform {
        self.c_t_b * *self.b_t_f.transform()
    }

    /// Pose of the object in `frame`.
    pub fn object_in(&self, frame: PoseFrame) -> Transform {
        match frame {
            PoseFrame::Fixture => self.f_t_o,
            PoseFrame::Base => *self.b_t_f.transform() * self.f_t_o,
            PoseFrame::Camera => self.camera_fixture() * self.f_t_o,
        }
    }
}
