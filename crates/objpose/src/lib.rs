#![doc = include_str!(concat!("../", env!("CARGO_PKG_README")))]

#[doc(inline)]
pub use objpose_3d as k3d;

#[doc(inline)]
pub use objpose_icp as icp;

#[doc(inline)]
pub use objpose_estimator as estimator;
