//! Transient device-buffer pool
//!
//! Scratch buffers for a dispatch (logits, head-major context) are lent from
//! here and returned when the [`PooledBuffer`] guard drops, on every exit
//! path. Device memory is only released when the pool itself is dropped.
//!
//! Requests round up to a power-of-two size class (never below the
//! configured minimum). A request takes the free buffer of the smallest class
//! that fits; the device is asked for a new allocation only when none is
//! free. There is no eviction.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::backend::ComputeDevice;
use crate::error::NattenResult;
use crate::invalid_argument;

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Device allocations made over the pool's lifetime
    pub allocations: usize,
    pub in_use: usize,
    pub free: usize,
    /// Bytes held (lent and free)
    pub held_bytes: usize,
    /// Most buffers ever lent at once
    pub high_water_mark: usize,
}

struct PoolState<B> {
    free: BTreeMap<usize, Vec<B>>,
    stats: PoolStats,
}

impl<B> PoolState<B> {
    fn lend(&mut self) {
        self.stats.in_use += 1;
        self.stats.high_water_mark = self.stats.high_water_mark.max(self.stats.in_use);
    }

    /// Smallest free buffer whose class is at least `class`
    fn take_fitting(&mut self, class: usize) -> Option<(usize, B)> {
        let (&found, list) = self
            .free
            .range_mut(class..)
            .find(|(_, list)| !list.is_empty())?;
        let buffer = list.pop()?;
        self.stats.free -= 1;
        Some((found, buffer))
    }
}

pub struct BufferPool<D: ComputeDevice> {
    device: Arc<D>,
    min_size_class: usize,
    state: Mutex<PoolState<D::Buffer>>,
}

impl<D: ComputeDevice> BufferPool<D> {
    /// `min_size_class` must be a power of two.
    pub fn new(device: Arc<D>, min_size_class: usize) -> NattenResult<Self> {
        if !min_size_class.is_power_of_two() {
            return Err(invalid_argument!(
                "pool size class must be a power of two, got {}",
                min_size_class
            ));
        }
        Ok(BufferPool {
            device,
            min_size_class,
            state: Mutex::new(PoolState {
                free: BTreeMap::new(),
                stats: PoolStats::default(),
            }),
        })
    }

    /// Size class serving a request of `byte_size`
    pub fn size_class(&self, byte_size: usize) -> NattenResult<usize> {
        byte_size
            .max(self.min_size_class)
            .checked_next_power_of_two()
            .ok_or_else(|| invalid_argument!("buffer request of {} bytes is too large", byte_size))
    }

    /// Lend a buffer of at least `byte_size` bytes.
    ///
    /// # Errors
    /// `OutOfDeviceMemory` when no free buffer fits and the device refuses a
    /// new allocation.
    pub fn acquire(&self, byte_size: usize) -> NattenResult<PooledBuffer<'_, D>> {
        let class = self.size_class(byte_size)?;

        {
            let mut state = self.state.lock()?;
            if let Some((found, buffer)) = state.take_fitting(class) {
                state.lend();
                tracing::trace!(requested = byte_size, size_class = found, "pool hit");
                return Ok(self.guard(found, buffer));
            }
        }

        // Allocate outside the lock; concurrent misses may each allocate.
        let buffer = self.device.allocate(class)?;

        let mut state = self.state.lock()?;
        state.stats.allocations += 1;
        state.stats.held_bytes += class;
        state.lend();
        tracing::debug!(
            requested = byte_size,
            size_class = class,
            allocations = state.stats.allocations,
            held_bytes = state.stats.held_bytes,
            "pool grew"
        );
        drop(state);

        Ok(self.guard(class, buffer))
    }

    /// Return a lent buffer; same as dropping the guard.
    pub fn release(&self, buffer: PooledBuffer<'_, D>) {
        drop(buffer);
    }

    pub fn stats(&self) -> NattenResult<PoolStats> {
        Ok(self.state.lock()?.stats)
    }

    pub fn min_size_class(&self) -> usize {
        self.min_size_class
    }

    fn guard(&self, size_class: usize, buffer: D::Buffer) -> PooledBuffer<'_, D> {
        PooledBuffer {
            pool: self,
            size_class,
            buffer: Some(buffer),
        }
    }

    fn give_back(&self, size_class: usize, buffer: D::Buffer) {
        let mut state = lock_recovering(&self.state);
        state.free.entry(size_class).or_default().push(buffer);
        state.stats.in_use -= 1;
        state.stats.free += 1;
    }
}

impl<D: ComputeDevice> Drop for BufferPool<D> {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let held_bytes = state.stats.held_bytes;
        let free = std::mem::take(&mut state.free);

        let mut released = 0usize;
        for buffer in free.into_values().flatten() {
            self.device.free(buffer);
            released += 1;
        }
        tracing::debug!(released, held_bytes, "buffer pool dropped");
    }
}

/// A release must not be lost to a poisoned lock.
fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A buffer lent by a [`BufferPool`], returned on drop
pub struct PooledBuffer<'a, D: ComputeDevice> {
    pool: &'a BufferPool<D>,
    size_class: usize,
    /// Always `Some` until the guard drops
    buffer: Option<D::Buffer>,
}

impl<D: ComputeDevice> PooledBuffer<'_, D> {
    pub fn size_class(&self) -> usize {
        self.size_class
    }
}

impl<D: ComputeDevice> Deref for PooledBuffer<'_, D> {
    type Target = D::Buffer;

    fn deref(&self) -> &D::Buffer {
        match &self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("pooled buffer accessed after release"),
        }
    }
}

impl<D: ComputeDevice> Drop for PooledBuffer<'_, D> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.give_back(self.size_class, buffer);
        }
    }
}
