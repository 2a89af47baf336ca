//! Host compute device
//!
//! A [`ComputeDevice`] whose memory is host RAM and whose programs run on a
//! rayon pool. It compiles the nine neighborhood-attention programs by
//! (source, entry point) like a GPU driver would, enforces an optional
//! memory limit, and executes a command stream in order, blocking until
//! the last dispatch finishes.

pub mod programs;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use serde::Serialize;

use crate::backend::device::{CommandStream, ComputeDevice, Dispatch, GridSize, ELEMENT_BYTES};
use crate::config::NattenConfig;
use crate::error::{NattenError, NattenResult};
use crate::kernels::ProgramId;
use crate::{execution_error, invalid_argument};

pub use programs::HostKernel;

/// Device-lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostDeviceStats {
    /// Compile requests, failed ones included
    pub compilations: usize,
    pub allocations: usize,
    pub frees: usize,
    pub submissions: usize,
    /// Dispatches that ran to completion
    pub dispatches: usize,
    /// Bytes currently allocated
    pub live_bytes: usize,
}

pub struct HostBuffer {
    id: u64,
    byte_size: usize,
    data: RwLock<Vec<f32>>,
    live_bytes: Arc<AtomicUsize>,
}

impl HostBuffer {
    /// Device-unique buffer id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("id", &self.id)
            .field("byte_size", &self.byte_size)
            .finish()
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        self.live_bytes.fetch_sub(self.byte_size, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct HostPipeline {
    program: ProgramId,
    kernel: HostKernel,
}

impl HostPipeline {
    pub fn program(&self) -> ProgramId {
        self.program
    }
}

/// Arguments of one program launch as the kernel sees them
pub struct KernelInvocation<'a> {
    pub label: &'static str,
    pub params: &'a [u8],
    pub grid: GridSize,
    inputs: Vec<Option<&'a [f32]>>,
}

impl<'a> KernelInvocation<'a> {
    /// Bound input `slot`, starting at its binding offset
    pub fn input(&self, slot: usize) -> NattenResult<&'a [f32]> {
        self.inputs
            .get(slot)
            .copied()
            .flatten()
            .ok_or_else(|| execution_error!("{}: input slot {} is not bound", self.label, slot))
    }
}

pub struct HostDevice {
    memory_limit: Option<usize>,
    workers: Option<rayon::ThreadPool>,
    live_bytes: Arc<AtomicUsize>,
    next_buffer_id: AtomicU64,
    compilations: AtomicUsize,
    allocations: AtomicUsize,
    frees: AtomicUsize,
    submissions: AtomicUsize,
    dispatches: AtomicUsize,
}

impl HostDevice {
    /// Unlimited memory, global rayon pool
    pub fn new() -> Self {
        Self::with_memory_limit(None)
    }

    pub fn with_memory_limit(memory_limit: Option<usize>) -> Self {
        HostDevice {
            memory_limit,
            workers: None,
            live_bytes: Arc::new(AtomicUsize::new(0)),
            next_buffer_id: AtomicU64::new(1),
            compilations: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            submissions: AtomicUsize::new(0),
            dispatches: AtomicUsize::new(0),
        }
    }

    /// Memory limit and worker count from `config`.
    ///
    /// # Errors
    /// `InvalidConfiguration` when the worker pool cannot be built.
    pub fn from_config(config: &NattenConfig) -> NattenResult<Self> {
        let mut device = Self::with_memory_limit(config.device_memory_limit);
        if let Some(threads) = config.host_worker_threads {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("natten-host-{}", i))
                .build()
                .map_err(|e| NattenError::InvalidConfiguration(format!("host workers: {}", e)))?;
            device.workers = Some(pool);
        }
        Ok(device)
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }

    pub fn stats(&self) -> HostDeviceStats {
        HostDeviceStats {
            compilations: self.compilations.load(Ordering::SeqCst),
            allocations: self.allocations.load(Ordering::SeqCst),
            frees: self.frees.load(Ordering::SeqCst),
            submissions: self.submissions.load(Ordering::SeqCst),
            dispatches: self.dispatches.load(Ordering::SeqCst),
            live_bytes: self.live_bytes.load(Ordering::SeqCst),
        }
    }

    fn execute(&self, dispatch: &Dispatch<'_, Self>) -> NattenResult<()> {
        let output_id = dispatch.output.buffer.id;
        if dispatch
            .inputs
            .iter()
            .flatten()
            .any(|binding| binding.buffer.id == output_id)
        {
            return Err(execution_error!(
                "buffer {} is bound as both input and output",
                output_id
            ));
        }

        // One read guard per distinct buffer; q and k may share storage.
        let mut guards: Vec<(u64, RwLockReadGuard<'_, Vec<f32>>)> = Vec::new();
        let mut slots: Vec<Option<(usize, usize)>> = Vec::with_capacity(dispatch.inputs.len());
        for binding in &dispatch.inputs {
            let Some(binding) = binding else {
                slots.push(None);
                continue;
            };
            let index = match guards.iter().position(|(id, _)| *id == binding.buffer.id) {
                Some(index) => index,
                None => {
                    guards.push((binding.buffer.id, binding.buffer.data.read()?));
                    guards.len() - 1
                }
            };
            slots.push(Some((index, binding.offset)));
        }

        let inputs = slots
            .iter()
            .map(|slot| {
                slot.map(|(index, offset)| {
                    let (id, data) = &guards[index];
                    data.get(offset..).ok_or_else(|| {
                        execution_error!("offset {} is past the end of buffer {}", offset, id)
                    })
                })
                .transpose()
            })
            .collect::<NattenResult<Vec<_>>>()?;

        let mut output = dispatch.output.buffer.data.write()?;
        let output_len = output.len();
        let target = output.get_mut(dispatch.output.offset..).ok_or_else(|| {
            execution_error!(
                "output offset {} is past the end of a buffer of {} elements",
                dispatch.output.offset,
                output_len
            )
        })?;

        let invocation = KernelInvocation {
            label: dispatch.label,
            params: &dispatch.params,
            grid: dispatch.grid,
            inputs,
        };
        let kernel = dispatch.pipeline.kernel;
        match &self.workers {
            Some(pool) => pool.install(|| kernel(&invocation, target)),
            None => kernel(&invocation, target),
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeDevice for HostDevice {
    type Buffer = HostBuffer;
    type Pipeline = HostPipeline;

    fn name(&self) -> &str {
        "host"
    }

    fn compile(&self, source_id: &str, entry_point: &str) -> NattenResult<HostPipeline> {
        self.compilations.fetch_add(1, Ordering::SeqCst);

        let failed = |reason: &str| NattenError::CompilationFailed {
            source_id: source_id.to_string(),
            entry_point: entry_point.to_string(),
            reason: reason.to_string(),
        };
        if !ProgramId::ALL.iter().any(|p| p.source_id() == source_id) {
            return Err(failed("unknown program source"));
        }
        let program =
            ProgramId::find(source_id, entry_point).ok_or_else(|| failed("entry point not found"))?;

        Ok(HostPipeline {
            program,
            kernel: programs::kernel_for(program),
        })
    }

    fn allocate(&self, byte_size: usize) -> NattenResult<HostBuffer> {
        let reserved = self
            .live_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                let next = live.checked_add(byte_size)?;
                match self.memory_limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            });
        if let Err(live) = reserved {
            return Err(NattenError::OutOfDeviceMemory {
                requested: byte_size,
                available: self.memory_limit.unwrap_or(usize::MAX).saturating_sub(live),
            });
        }

        self.allocations.fetch_add(1, Ordering::SeqCst);
        let words = byte_size.div_ceil(ELEMENT_BYTES);
        Ok(HostBuffer {
            id: self.next_buffer_id.fetch_add(1, Ordering::SeqCst),
            byte_size,
            data: RwLock::new(vec![0.0; words]),
            live_bytes: Arc::clone(&self.live_bytes),
        })
    }

    fn free(&self, buffer: HostBuffer) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        drop(buffer);
    }

    fn buffer_size(&self, buffer: &HostBuffer) -> usize {
        buffer.byte_size
    }

    fn write_buffer(&self, buffer: &HostBuffer, data: &[f32]) -> NattenResult<()> {
        let bytes = std::mem::size_of_val(data);
        if bytes > buffer.byte_size {
            return Err(invalid_argument!(
                "write of {} bytes exceeds buffer of {} bytes",
                bytes,
                buffer.byte_size
            ));
        }
        let mut storage = buffer.data.write()?;
        storage[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &HostBuffer) -> NattenResult<Vec<f32>> {
        Ok(buffer.data.read()?.clone())
    }

    fn submit(&self, stream: CommandStream<'_, Self>) -> NattenResult<()> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        for dispatch in stream.into_dispatches() {
            self.execute(&dispatch).map_err(|e| {
                tracing::warn!(label = dispatch.label, error = %e, "dispatch failed");
                match e {
                    NattenError::DeviceExecutionFailed(msg) => {
                        execution_error!("{}: {}", dispatch.label, msg)
                    }
                    other => other,
                }
            })?;
            self.dispatches.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
