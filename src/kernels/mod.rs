//! Compute programs: identities and the compile-once cache

pub mod cache;
pub mod registry;

pub use cache::{KernelCache, ProgramHandle, ProgramKey};
pub use registry::{ProgramId, SpatialRank, Stage};
