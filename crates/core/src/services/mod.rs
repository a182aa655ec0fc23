//! Analysis services: the backend-neutral model, concrete backends, and the
//! per-function string extraction that walks a recovered CFG.

pub mod analysis;
pub mod backends;
pub mod extraction;
#[cfg(feature = "capstone-backend")]
pub mod image;
