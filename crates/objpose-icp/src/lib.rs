#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

mod azimuth;
pub use azimuth::*;

mod correspondence;
pub use correspondence::Correspondence;

mod dof;
pub use dof::DofMask;

mod error;
pub use error::RegistrationError;

mod icp_dof;
pub use icp_dof::*;
