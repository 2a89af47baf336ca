//! Kernel/pipeline cache
//!
//! Compiled programs are memoized per (source identifier, entry point) for
//! the lifetime of the cache and never evicted. Programs live in a
//! fixed-capacity arena; callers hold a [`ProgramHandle`] and borrow the
//! pipeline from the cache.
//!
//! The index lock covers only the key lookup and slot reservation. Each slot
//! is a once-cell, so concurrent first requests for one key wait on a single
//! compilation instead of starting their own, and compilations of different
//! keys run in parallel. A failed compilation is remembered and reported to
//! every later requester of that key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::backend::ComputeDevice;
use crate::error::{NattenError, NattenResult};
use crate::internal_error;

use super::ProgramId;

/// Cache key: where a program lives on the device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub source_id: String,
    pub entry_point: String,
}

impl ProgramKey {
    pub fn new(source_id: &str, entry_point: &str) -> Self {
        ProgramKey {
            source_id: source_id.to_string(),
            entry_point: entry_point.to_string(),
        }
    }
}

impl From<ProgramId> for ProgramKey {
    fn from(program: ProgramId) -> Self {
        ProgramKey::new(program.source_id(), program.entry_point())
    }
}

/// Index of a compiled program in its cache's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(u32);

impl ProgramHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

type Slot<P> = OnceCell<Result<P, NattenError>>;

pub struct KernelCache<D: ComputeDevice> {
    device: Arc<D>,
    index: Mutex<HashMap<ProgramKey, ProgramHandle>>,
    slots: Box<[Slot<D::Pipeline>]>,
}

impl<D: ComputeDevice> KernelCache<D> {
    pub fn new(device: Arc<D>, capacity: usize) -> Self {
        KernelCache {
            device,
            index: Mutex::new(HashMap::with_capacity(capacity)),
            slots: (0..capacity).map(|_| OnceCell::new()).collect(),
        }
    }

    /// Handle to the compiled program, compiling it on first request.
    ///
    /// # Errors
    /// - `CompilationFailed` from the device, now or on an earlier request
    /// - `ResourceExhausted` when the arena has no free slot for a new key
    pub fn get_or_compile(&self, source_id: &str, entry_point: &str) -> NattenResult<ProgramHandle> {
        let handle = self.reserve(ProgramKey::new(source_id, entry_point))?;

        let compiled = self.slots[handle.index()].get_or_init(|| {
            let started = std::time::Instant::now();
            let result = self.device.compile(source_id, entry_point);
            match &result {
                Ok(_) => tracing::debug!(
                    source_id,
                    entry_point,
                    slot = handle.index(),
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "compiled program"
                ),
                Err(e) => tracing::warn!(source_id, entry_point, error = %e, "compilation failed"),
            }
            result
        });

        match compiled {
            Ok(_) => Ok(handle),
            Err(e) => Err(e.clone()),
        }
    }

    pub fn get_or_compile_program(&self, program: ProgramId) -> NattenResult<ProgramHandle> {
        self.get_or_compile(program.source_id(), program.entry_point())
    }

    /// Borrow a compiled pipeline.
    pub fn pipeline(&self, handle: ProgramHandle) -> NattenResult<&D::Pipeline> {
        match self.slots.get(handle.index()).and_then(|slot| slot.get()) {
            Some(Ok(pipeline)) => Ok(pipeline),
            Some(Err(e)) => Err(e.clone()),
            None => Err(internal_error!(
                "program slot {} is not compiled",
                handle.index()
            )),
        }
    }

    /// Handle for an already-registered key, without compiling
    pub fn lookup(&self, source_id: &str, entry_point: &str) -> NattenResult<Option<ProgramHandle>> {
        let index = self.index.lock()?;
        Ok(index.get(&ProgramKey::new(source_id, entry_point)).copied())
    }

    /// Number of registered program identities
    pub fn len(&self) -> NattenResult<usize> {
        Ok(self.index.lock()?.len())
    }

    pub fn is_empty(&self) -> NattenResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn reserve(&self, key: ProgramKey) -> NattenResult<ProgramHandle> {
        let mut index = self.index.lock()?;
        if let Some(&handle) = index.get(&key) {
            return Ok(handle);
        }

        let next = index.len();
        if next >= self.slots.len() {
            return Err(NattenError::ResourceExhausted(format!(
                "kernel cache holds {} programs; cannot add {}::{}",
                self.slots.len(),
                key.source_id,
                key.entry_point
            )));
        }

        let handle = ProgramHandle(next as u32);
        index.insert(key, handle);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostDevice;
    use crate::kernels::{SpatialRank, Stage};

    fn cache(capacity: usize) -> (Arc<HostDevice>, KernelCache<HostDevice>) {
        let device = Arc::new(HostDevice::new());
        (Arc::clone(&device), KernelCache::new(device, capacity))
    }

    #[test]
    fn test_hit_does_not_recompile() {
        let (device, cache) = cache(4);
        let first = cache.get_or_compile("natten1d", "na1d_qkrpb").unwrap();
        let second = cache.get_or_compile("natten1d", "na1d_qkrpb").unwrap();

        assert_eq!(first, second);
        assert_eq!(device.stats().compilations, 1);
        assert_eq!(cache.len().unwrap(), 1);
        assert!(cache.pipeline(first).is_ok());
    }

    #[test]
    fn test_distinct_keys_get_distinct_slots() {
        let (device, cache) = cache(9);
        let handles: Vec<_> = ProgramId::ALL
            .iter()
            .map(|&p| cache.get_or_compile_program(p).unwrap())
            .collect();

        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.index(), i);
        }
        assert_eq!(device.stats().compilations, 9);
    }

    #[test]
    fn test_failure_is_memoized() {
        let (device, cache) = cache(4);
        let err = cache.get_or_compile("natten1d", "no_such_entry").unwrap_err();
        assert!(matches!(err, NattenError::CompilationFailed { .. }));

        let again = cache.get_or_compile("natten1d", "no_such_entry").unwrap_err();
        assert_eq!(err, again);
        assert_eq!(device.stats().compilations, 1);

        let handle = cache.lookup("natten1d", "no_such_entry").unwrap().unwrap();
        assert!(cache.pipeline(handle).is_err());
    }

    #[test]
    fn test_capacity_exhausted() {
        let (_, cache) = cache(1);
        cache
            .get_or_compile_program(ProgramId::new(SpatialRank::One, Stage::Av))
            .unwrap();
        let err = cache
            .get_or_compile_program(ProgramId::new(SpatialRank::Two, Stage::Av))
            .unwrap_err();
        assert!(matches!(err, NattenError::ResourceExhausted(_)));
    }

    #[test]
    fn test_concurrent_first_requests_compile_once() {
        let (device, cache) = cache(4);
        let barrier = std::sync::Barrier::new(16);

        let handles: Vec<ProgramHandle> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.get_or_compile("natten2d", "na2d_av").unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert!(handles.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(device.stats().compilations, 1);
    }

    #[test]
    fn test_unknown_handle() {
        let (_, cache) = cache(2);
        assert!(matches!(
            cache.pipeline(ProgramHandle(1)),
            Err(NattenError::InternalError(_))
        ));
    }

    #[test]
    fn test_len_reports_poisoned_index() {
        let (_, cache) = cache(2);
        assert!(cache.is_empty().unwrap());

        let poisoner = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = cache.index.lock().unwrap();
            panic!("poison the index");
        }));
        assert!(poisoner.is_err());

        assert!(matches!(cache.len(), Err(NattenError::LockPoisoned(_))));
        assert!(cache.is_empty().is_err());
    }
}
