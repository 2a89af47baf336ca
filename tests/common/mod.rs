//! Common test utilities for neighborhood attention
//!
//! - deterministic data generation and upload helpers
//! - a naive reference implementation written directly from the window
//!   definition, in f64
//! - a device whose command streams always fault
//! - a device that refuses to compile some entry points

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nattenforge::backend::{
    CommandStream, ComputeDevice, Dispatch, HostBuffer, HostDevice, HostPipeline,
};
use nattenforge::{HostContext, NattenConfig, NattenContext, NattenError, NattenResult};

// Simple deterministic random number generator for testing
pub struct SimpleRng {
    seed: u32,
}

impl SimpleRng {
    pub fn new(seed: u32) -> Self {
        SimpleRng { seed }
    }

    /// Uniform in [-1, 1)
    pub fn gen_f32(&mut self) -> f32 {
        self.seed = self.seed.wrapping_mul(1103515245).wrapping_add(12345);
        (self.seed as f32) / (u32::MAX as f32) * 2.0 - 1.0
    }

    pub fn vec(&mut self, len: usize) -> Vec<f32> {
        (0..len).map(|_| self.gen_f32()).collect()
    }
}

/// Fresh host context with default configuration
pub fn host_ctx() -> HostContext {
    nattenforge::logging::init_logging_default();
    NattenContext::host(&NattenConfig::default()).expect("default config is valid")
}

pub fn upload<D: ComputeDevice>(device: &D, data: &[f32]) -> D::Buffer {
    let buffer = device
        .allocate(std::mem::size_of_val(data).max(4))
        .expect("allocation");
    device.write_buffer(&buffer, data).expect("upload");
    buffer
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol,
            "element {}: got {}, expected {} (tol {})",
            i,
            a,
            e,
            tol
        );
    }
}

/// Problem geometry for the reference, spatial axes as `[z, y, x]`
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub batch: usize,
    pub heads: usize,
    pub dim: usize,
    pub extent: [usize; 3],
    pub original: [usize; 3],
    pub kernel: [usize; 3],
    pub dilation: [usize; 3],
    pub causal: bool,
}

impl Geometry {
    pub fn one_d(batch: usize, heads: usize, length: usize, dim: usize, kernel: usize) -> Self {
        Geometry {
            batch,
            heads,
            dim,
            extent: [1, 1, length],
            original: [1, 1, length],
            kernel: [1, 1, kernel],
            dilation: [1; 3],
            causal: false,
        }
    }

    pub fn two_d(batch: usize, heads: usize, hw: [usize; 2], dim: usize, kernel: usize) -> Self {
        Geometry {
            batch,
            heads,
            dim,
            extent: [1, hw[0], hw[1]],
            original: [1, hw[0], hw[1]],
            kernel: [1, kernel, kernel],
            dilation: [1; 3],
            causal: false,
        }
    }

    pub fn positions(&self) -> usize {
        self.extent.iter().product()
    }

    /// Elements of a dense q/k/v tensor
    pub fn qkv_len(&self) -> usize {
        self.batch * self.heads * self.positions() * self.dim
    }

    /// Elements of a dense `[H, 2K-1, ...]` bias table
    pub fn rpb_len(&self) -> usize {
        self.heads * self.kernel.iter().map(|k| 2 * k - 1).product::<usize>()
    }
}

/// Window of one query on one axis; `None` marks a masked slot.
pub fn reference_window(
    q: usize,
    length: usize,
    kernel: usize,
    dilation: usize,
    causal: bool,
) -> Vec<Option<usize>> {
    let span = ((kernel - 1) * dilation) as i64;
    let start = if causal {
        (q.min(length - 1)) as i64 - span
    } else {
        let centered = q as i64 - (kernel / 2 * dilation) as i64;
        centered.min(length as i64 - span - 1).max(0)
    };
    (0..kernel)
        .map(|j| {
            let c = start + (j * dilation) as i64;
            (c >= 0 && c < length as i64).then_some(c as usize)
        })
        .collect()
}

fn reference_rpb_index(q: usize, key: usize, kernel: usize, dilation: usize) -> usize {
    let offset = (key as i64 - q as i64).div_euclid(dilation as i64);
    (kernel as i64 - 1 + offset).clamp(0, 2 * (kernel as i64 - 1)) as usize
}

/// Naive forward pass over dense inputs. Output is dense `[B, z, y, x, H*D]`.
pub fn reference_forward(
    g: &Geometry,
    query: &[f32],
    key: &[f32],
    value: &[f32],
    rpb: Option<&[f32]>,
) -> Vec<f32> {
    let [ez, ey, ex] = g.extent;
    let [kz, ky, kx] = g.kernel;
    let table = [2 * kz - 1, 2 * ky - 1, 2 * kx - 1];
    let idx = |b: usize, h: usize, c: [usize; 3], d: usize| {
        ((((b * g.heads + h) * ez + c[0]) * ey + c[1]) * ex + c[2]) * g.dim + d
    };

    let mut out = vec![0.0f32; g.qkv_len()];
    for b in 0..g.batch {
        for h in 0..g.heads {
            for z in 0..ez {
                for y in 0..ey {
                    for x in 0..ex {
                        let c = [z, y, x];
                        let windows: Vec<Vec<Option<usize>>> = (0..3)
                            .map(|a| {
                                reference_window(
                                    c[a],
                                    g.original[a],
                                    g.kernel[a],
                                    g.dilation[a],
                                    g.causal,
                                )
                            })
                            .collect();

                        let mut keys = Vec::new();
                        for &wz in &windows[0] {
                            for &wy in &windows[1] {
                                for &wx in &windows[2] {
                                    keys.push(match (wz, wy, wx) {
                                        (Some(wz), Some(wy), Some(wx)) => Some([wz, wy, wx]),
                                        _ => None,
                                    });
                                }
                            }
                        }

                        let logits: Vec<f64> = keys
                            .iter()
                            .map(|key_coord| match key_coord {
                                None => f64::NEG_INFINITY,
                                Some(kc) => {
                                    let mut dot = 0.0f64;
                                    for d in 0..g.dim {
                                        dot += query[idx(b, h, c, d)] as f64
                                            * key[idx(b, h, *kc, d)] as f64;
                                    }
                                    if let Some(bias) = rpb {
                                        let r: Vec<usize> = (0..3)
                                            .map(|a| {
                                                reference_rpb_index(
                                                    c[a],
                                                    kc[a],
                                                    g.kernel[a],
                                                    g.dilation[a],
                                                )
                                            })
                                            .collect();
                                        let i = ((h * table[0] + r[0]) * table[1] + r[1])
                                            * table[2]
                                            + r[2];
                                        dot += bias[i] as f64;
                                    }
                                    dot
                                }
                            })
                            .collect();

                        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                        let weights: Vec<f64> = if max == f64::NEG_INFINITY {
                            vec![0.0; logits.len()]
                        } else {
                            let e: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
                            let s: f64 = e.iter().sum();
                            e.into_iter().map(|v| v / s).collect()
                        };

                        let position = (z * ey + y) * ex + x;
                        for d in 0..g.dim {
                            let mut acc = 0.0f64;
                            for (w, key_coord) in weights.iter().zip(&keys) {
                                if let Some(kc) = key_coord {
                                    acc += w * value[idx(b, h, *kc, d)] as f64;
                                }
                            }
                            let o = (b * g.positions() + position) * g.heads * g.dim + h * g.dim + d;
                            out[o] = acc as f32;
                        }
                    }
                }
            }
        }
    }
    out
}

/// Random q, k, v (and optional bias) for `g`, uploaded to `device`
pub struct Inputs {
    pub query: Vec<f32>,
    pub key: Vec<f32>,
    pub value: Vec<f32>,
    pub rpb: Option<Vec<f32>>,
}

impl Inputs {
    pub fn random(g: &Geometry, seed: u32, with_rpb: bool) -> Self {
        let mut rng = SimpleRng::new(seed);
        Inputs {
            query: rng.vec(g.qkv_len()),
            key: rng.vec(g.qkv_len()),
            value: rng.vec(g.qkv_len()),
            rpb: with_rpb.then(|| rng.vec(g.rpb_len())),
        }
    }

    pub fn expected(&self, g: &Geometry) -> Vec<f32> {
        reference_forward(g, &self.query, &self.key, &self.value, self.rpb.as_deref())
    }
}

/// A device that compiles and allocates like [`HostDevice`] but whose
/// command streams always fault.
pub struct FailingDevice {
    pub inner: HostDevice,
    pub submissions: AtomicUsize,
}

impl FailingDevice {
    pub fn new() -> Self {
        FailingDevice {
            inner: HostDevice::new(),
            submissions: AtomicUsize::new(0),
        }
    }

    pub fn context(self) -> NattenContext<FailingDevice> {
        NattenContext::new(Arc::new(self), &NattenConfig::default()).expect("context")
    }
}

impl ComputeDevice for FailingDevice {
    type Buffer = HostBuffer;
    type Pipeline = HostPipeline;

    fn name(&self) -> &str {
        "failing"
    }

    fn compile(&self, source_id: &str, entry_point: &str) -> NattenResult<HostPipeline> {
        self.inner.compile(source_id, entry_point)
    }

    fn allocate(&self, byte_size: usize) -> NattenResult<HostBuffer> {
        self.inner.allocate(byte_size)
    }

    fn free(&self, buffer: HostBuffer) {
        self.inner.free(buffer)
    }

    fn buffer_size(&self, buffer: &HostBuffer) -> usize {
        self.inner.buffer_size(buffer)
    }

    fn write_buffer(&self, buffer: &HostBuffer, data: &[f32]) -> NattenResult<()> {
        self.inner.write_buffer(buffer, data)
    }

    fn read_buffer(&self, buffer: &HostBuffer) -> NattenResult<Vec<f32>> {
        self.inner.read_buffer(buffer)
    }

    fn submit(&self, stream: CommandStream<'_, Self>) -> NattenResult<()> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        Err(NattenError::DeviceExecutionFailed(format!(
            "injected fault in a stream of {} dispatches",
            stream.len()
        )))
    }
}

/// A [`HostDevice`] that fails to compile every entry point ending in
/// `suffix`.
pub struct RejectingDevice {
    pub inner: HostDevice,
    pub suffix: &'static str,
    pub attempts: AtomicUsize,
}

impl RejectingDevice {
    pub fn new(suffix: &'static str) -> Self {
        RejectingDevice {
            inner: HostDevice::new(),
            suffix,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn context(self) -> NattenContext<RejectingDevice> {
        NattenContext::new(Arc::new(self), &NattenConfig::default()).expect("context")
    }
}

impl ComputeDevice for RejectingDevice {
    type Buffer = HostBuffer;
    type Pipeline = HostPipeline;

    fn name(&self) -> &str {
        "rejecting"
    }

    fn compile(&self, source_id: &str, entry_point: &str) -> NattenResult<HostPipeline> {
        if entry_point.ends_with(self.suffix) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            return Err(NattenError::CompilationFailed {
                source_id: source_id.to_string(),
                entry_point: entry_point.to_string(),
                reason: "unsupported on this device".to_string(),
            });
        }
        self.inner.compile(source_id, entry_point)
    }

    fn allocate(&self, byte_size: usize) -> NattenResult<HostBuffer> {
        self.inner.allocate(byte_size)
    }

    fn free(&self, buffer: HostBuffer) {
        self.inner.free(buffer)
    }

    fn buffer_size(&self, buffer: &HostBuffer) -> usize {
        self.inner.buffer_size(buffer)
    }

    fn write_buffer(&self, buffer: &HostBuffer, data: &[f32]) -> NattenResult<()> {
        self.inner.write_buffer(buffer, data)
    }

    fn read_buffer(&self, buffer: &HostBuffer) -> NattenResult<Vec<f32>> {
        self.inner.read_buffer(buffer)
    }

    fn submit(&self, stream: CommandStream<'_, Self>) -> NattenResult<()> {
        self.inner.submit(stream_on_inner(stream))
    }
}

/// Re-home a stream encoded for a wrapper device onto its inner [`HostDevice`].
fn stream_on_inner<'a, D>(stream: CommandStream<'a, D>) -> CommandStream<'a, HostDevice>
where
    D: ComputeDevice<Buffer = HostBuffer, Pipeline = HostPipeline>,
{
    let mut inner = CommandStream::new();
    for d in stream.into_dispatches() {
        let Dispatch {
            label,
            pipeline,
            grid,
            params,
            inputs,
            output,
        } = d;
        inner.push(Dispatch {
            label,
            pipeline,
            grid,
            params,
            inputs,
            output,
        });
    }
    inner
}
