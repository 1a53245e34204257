#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Scene preprocessing filters.
pub mod filters;

/// Robust plane estimation.
pub mod plane;

/// Point cloud container.
pub mod pointcloud;

/// 3D transforms.
pub mod transforms;

/// Voxel grid downsampling.
pub mod voxel_grid;
