//! Compute backends
//!
//! The engine is generic over [`ComputeDevice`]; [`HostDevice`] is the
//! bundled implementation.

pub mod device;
pub mod host;

pub use device::{Binding, CommandStream, ComputeDevice, Dispatch, GridSize, ELEMENT_BYTES};
pub use host::{HostBuffer, HostDevice, HostDeviceStats, HostPipeline, KernelInvocation};
