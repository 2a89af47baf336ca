//! Device memory management
//!
//! Every attention dispatch needs two scratch buffers whose sizes repeat from
//! call to call. Allocating them from the device each time is the dominant
//! per-call overhead on real hardware, so they come from a [`BufferPool`]
//! that keeps released buffers for reuse.

pub mod pool;

pub use pool::{BufferPool, PoolStats, PooledBuffer};
