//! Compute device abstraction
//!
//! A [`ComputeDevice`] offers the four capabilities the engine needs:
//! program compilation by (source, entry point), explicit device-memory
//! allocation, host transfers, and ordered execution of a
//! [`CommandStream`] that blocks until the device reports completion.

use crate::error::NattenResult;

/// Bytes per element; every tensor is `f32`.
pub const ELEMENT_BYTES: usize = std::mem::size_of::<f32>();

pub trait ComputeDevice: Send + Sync + 'static {
    /// Device memory allocation
    type Buffer: Send + Sync;
    /// Compiled program plus its launch state
    type Pipeline: Send + Sync;

    fn name(&self) -> &str;

    /// Build the program `entry_point` found in `source_id`.
    ///
    /// # Errors
    /// `CompilationFailed` when the source or entry point is unknown or the
    /// device cannot build it.
    fn compile(&self, source_id: &str, entry_point: &str) -> NattenResult<Self::Pipeline>;

    /// # Errors
    /// `OutOfDeviceMemory` when the allocator refuses the request.
    fn allocate(&self, byte_size: usize) -> NattenResult<Self::Buffer>;

    fn free(&self, buffer: Self::Buffer);

    /// Capacity in bytes
    fn buffer_size(&self, buffer: &Self::Buffer) -> usize;

    /// Copy `data` to the start of `buffer`.
    fn write_buffer(&self, buffer: &Self::Buffer, data: &[f32]) -> NattenResult<()>;

    /// Copy the whole buffer back to the host.
    fn read_buffer(&self, buffer: &Self::Buffer) -> NattenResult<Vec<f32>>;

    /// Execute every dispatch of `stream` in order and wait for completion.
    ///
    /// # Errors
    /// `DeviceExecutionFailed` when any dispatch faults; later dispatches do
    /// not run.
    fn submit(&self, stream: CommandStream<'_, Self>) -> NattenResult<()>
    where
        Self: Sized;
}

/// Thread-space extents of one dispatch, `x` varying fastest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSize {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl GridSize {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        GridSize { x, y, z }
    }

    pub fn linear(threads: usize) -> Self {
        GridSize::new(threads, 1, 1)
    }

    pub fn threads(&self) -> usize {
        self.x * self.y * self.z
    }

    /// Thread id to `(x, y, z)`
    pub fn unravel(&self, thread: usize) -> (usize, usize, usize) {
        let x = thread % self.x;
        let y = (thread / self.x) % self.y;
        let z = thread / (self.x * self.y);
        (x, y, z)
    }
}

/// A buffer bound to a program argument slot
pub struct Binding<'a, B> {
    pub buffer: &'a B,
    /// Element offset of the tensor's first element
    pub offset: usize,
}

impl<'a, B> Binding<'a, B> {
    pub fn new(buffer: &'a B) -> Self {
        Binding { buffer, offset: 0 }
    }

    pub fn at(buffer: &'a B, offset: usize) -> Self {
        Binding { buffer, offset }
    }
}

impl<B> Clone for Binding<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for Binding<'_, B> {}

/// One encoded program launch
pub struct Dispatch<'a, D: ComputeDevice> {
    pub label: &'static str,
    pub pipeline: &'a D::Pipeline,
    pub grid: GridSize,
    /// Raw parameter block (a `#[repr(C)]` descriptor)
    pub params: Vec<u8>,
    /// Read-only arguments; `None` marks an absent optional tensor
    pub inputs: Vec<Option<Binding<'a, D::Buffer>>>,
    /// The single written argument
    pub output: Binding<'a, D::Buffer>,
}

/// Ordered list of dispatches submitted together
pub struct CommandStream<'a, D: ComputeDevice> {
    dispatches: Vec<Dispatch<'a, D>>,
}

impl<'a, D: ComputeDevice> CommandStream<'a, D> {
    pub fn new() -> Self {
        CommandStream {
            dispatches: Vec::new(),
        }
    }

    pub fn encode<P: bytemuck::Pod>(
        &mut self,
        label: &'static str,
        pipeline: &'a D::Pipeline,
        grid: GridSize,
        params: &P,
        inputs: Vec<Option<Binding<'a, D::Buffer>>>,
        output: Binding<'a, D::Buffer>,
    ) {
        self.push(Dispatch {
            label,
            pipeline,
            grid,
            params: bytemuck::bytes_of(params).to_vec(),
            inputs,
            output,
        });
    }

    /// Append an already-encoded dispatch.
    pub fn push(&mut self, dispatch: Dispatch<'a, D>) {
        self.dispatches.push(dispatch);
    }

    pub fn len(&self) -> usize {
        self.dispatches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }

    pub fn into_dispatches(self) -> Vec<Dispatch<'a, D>> {
        self.dispatches
    }
}

impl<D: ComputeDevice> Default for CommandStream<'_, D> {
    fn default() -> Self {
        Self::new()
    }
}
