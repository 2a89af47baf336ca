//! nattenforge - Neighborhood Attention on compute devices
//!
//! Neighborhood attention restricts each query to a fixed-size, optionally
//! dilated window of nearby keys over 1, 2 or 3 spatial axes. This crate
//! runs the forward pass as a short command stream of compute programs
//! (`qk_rpb`, `av`, `permute_reshape`) over strided device tensors.
//!
//! Building blocks:
//! - [`backend::ComputeDevice`]: compile, allocate and submit; the bundled
//!   [`HostDevice`] runs programs on a rayon pool
//! - [`kernels::KernelCache`]: compile-once program cache
//! - [`memory::BufferPool`]: reusable scratch buffers
//! - [`NattenContext`]: one device plus its cache and pool
//!
//! ```rust,no_run
//! use nattenforge::{host_context, na1d_forward, Na1dParams, TensorRef};
//! use nattenforge::backend::ComputeDevice;
//!
//! # fn main() -> nattenforge::NattenResult<()> {
//! let ctx = host_context()?;
//! let shape = vec![1, 2, 16, 8];
//! let bytes = shape.iter().product::<usize>() * 4;
//! let q = ctx.device().allocate(bytes)?;
//! let k = ctx.device().allocate(bytes)?;
//! let v = ctx.device().allocate(bytes)?;
//!
//! let out = na1d_forward(
//!     ctx,
//!     &TensorRef::contiguous(&q, shape.clone()),
//!     &TensorRef::contiguous(&k, shape.clone()),
//!     &TensorRef::contiguous(&v, shape),
//!     None,
//!     &Na1dParams::new(5).with_dilation(2),
//! )?;
//! assert_eq!(out.shape, vec![1, 16, 16]);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::too_many_arguments)] // Descriptor builders and kernel launches need many args
#![allow(clippy::needless_range_loop)] // Clearer for index arithmetic
#![allow(clippy::manual_slice_size_calculation)] // Common in buffer sizing code

pub mod attention;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod kernels;
pub mod logging;
pub mod memory;

pub use attention::{
    fmha_forward, na1d_forward, na2d_forward, na3d_forward, AttentionOutput, Na1dParams,
    Na2dParams, Na3dParams, TensorRef,
};
pub use backend::{HostBuffer, HostDevice};
pub use config::NattenConfig;
pub use context::{host_context, HostContext, NattenContext};
pub use error::{ErrorCategory, NattenError, NattenResult};
