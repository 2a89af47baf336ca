//! Forward dispatch
//!
//! A forward call is three programs over two pooled scratch buffers:
//!
//! ```text
//! query, key, rpb --qk_rpb--> logits [B, H, spatial, slots]
//! logits, value   --av------> context [B, H, spatial, D]   (softmax fused)
//! context         --permute-> output [B, spatial, H*D]
//! ```
//!
//! All three are encoded into one command stream and submitted together.
//! The call blocks until the device completes; scratch buffers return to
//! the pool on every exit path.

use std::time::Instant;

use crate::backend::{Binding, CommandStream, ComputeDevice, ELEMENT_BYTES};
use crate::context::NattenContext;
use crate::error::NattenResult;
use crate::kernels::{KernelCache, ProgramId, SpatialRank, Stage};

use super::descriptors::{
    Na1dAvParams, Na1dQkRpbParams, Na2dAvParams, Na2dQkRpbParams, Na3dAvParams, Na3dQkRpbParams,
    PermuteReshape1dParams, PermuteReshape2dParams, PermuteReshape3dParams, StageDescriptor,
};
use super::problem::{resolve, Hyper, Operands, Problem};
use super::{contiguous_strides, AttentionOutput, Na1dParams, Na2dParams, Na3dParams, TensorRef};

/// 1D neighborhood attention.
///
/// `query`, `key`, `value` are `[B, H, L, D]`; `rpb` is `[H, 2K-1]`. Returns a
/// dense `[B, L, H*D]` tensor in a newly allocated buffer.
///
/// # Errors
/// - `InvalidArgument` when shapes, strides or hyperparameters are rejected;
///   nothing has been allocated or dispatched
/// - `CompilationFailed`, `OutOfDeviceMemory`, `DeviceExecutionFailed` from
///   the device
pub fn na1d_forward<D: ComputeDevice>(
    ctx: &NattenContext<D>,
    query: &TensorRef<'_, D::Buffer>,
    key: &TensorRef<'_, D::Buffer>,
    value: &TensorRef<'_, D::Buffer>,
    rpb: Option<&TensorRef<'_, D::Buffer>>,
    params: &Na1dParams,
) -> NattenResult<AttentionOutput<D::Buffer>> {
    forward(ctx, Hyper::from(params), query, key, value, rpb)
}

/// 2D neighborhood attention over `[B, H, Y, X, D]`.
///
/// The square window of `kernel_size` per axis shares one dilation;
/// `rpb` is `[H, 2K-1, 2K-1]`.
pub fn na2d_forward<D: ComputeDevice>(
    ctx: &NattenContext<D>,
    query: &TensorRef<'_, D::Buffer>,
    key: &TensorRef<'_, D::Buffer>,
    value: &TensorRef<'_, D::Buffer>,
    rpb: Option<&TensorRef<'_, D::Buffer>>,
    params: &Na2dParams,
) -> NattenResult<AttentionOutput<D::Buffer>> {
    forward(ctx, Hyper::from(params), query, key, value, rpb)
}

/// 3D neighborhood attention over `[B, H, Z, Y, X, D]`.
pub fn na3d_forward<D: ComputeDevice>(
    ctx: &NattenContext<D>,
    query: &TensorRef<'_, D::Buffer>,
    key: &TensorRef<'_, D::Buffer>,
    value: &TensorRef<'_, D::Buffer>,
    rpb: Option<&TensorRef<'_, D::Buffer>>,
    params: &Na3dParams,
) -> NattenResult<AttentionOutput<D::Buffer>> {
    forward(ctx, Hyper::from(params), query, key, value, rpb)
}

/// Dense attention over `[B, H, L, D]`: 1D neighborhood attention whose
/// window spans the whole sequence.
pub fn fmha_forward<D: ComputeDevice>(
    ctx: &NattenContext<D>,
    query: &TensorRef<'_, D::Buffer>,
    key: &TensorRef<'_, D::Buffer>,
    value: &TensorRef<'_, D::Buffer>,
) -> NattenResult<AttentionOutput<D::Buffer>> {
    let length = if query.rank() == 4 { query.shape[2] } else { 0 };
    let params = Na1dParams::new(length);
    forward(ctx, Hyper::from(&params), query, key, value, None)
}

struct Pipelines<'a, D: ComputeDevice> {
    qk: &'a D::Pipeline,
    av: &'a D::Pipeline,
    permute: &'a D::Pipeline,
}

fn pipelines<D: ComputeDevice>(
    ctx: &NattenContext<D>,
    rank: SpatialRank,
) -> NattenResult<Pipelines<'_, D>> {
    let kernels = ctx.kernels();
    Ok(Pipelines {
        qk: compiled(kernels, ProgramId::new(rank, Stage::QkRpb))?,
        av: compiled(kernels, ProgramId::new(rank, Stage::Av))?,
        permute: compiled(kernels, ProgramId::new(rank, Stage::PermuteReshape))?,
    })
}

fn compiled<D: ComputeDevice>(
    kernels: &KernelCache<D>,
    program: ProgramId,
) -> NattenResult<&D::Pipeline> {
    let handle = kernels.get_or_compile_program(program)?;
    kernels.pipeline(handle)
}

fn forward<D: ComputeDevice>(
    ctx: &NattenContext<D>,
    hyper: Hyper,
    query: &TensorRef<'_, D::Buffer>,
    key: &TensorRef<'_, D::Buffer>,
    value: &TensorRef<'_, D::Buffer>,
    rpb: Option<&TensorRef<'_, D::Buffer>>,
) -> NattenResult<AttentionOutput<D::Buffer>> {
    let started = Instant::now();
    let device = ctx.device();
    let (problem, operands) = resolve(hyper, query, key, value, rpb, |buffer| {
        device.buffer_size(buffer) / ELEMENT_BYTES
    })?;

    let span = tracing::debug_span!(
        "na_forward",
        rank = %problem.rank,
        batch = problem.batch,
        heads = problem.heads,
        dim = problem.dim,
        positions = problem.positions(),
        slots = problem.slots(),
        causal = problem.causal,
    );
    let _entered = span.enter();

    let pipelines = pipelines(ctx, problem.rank)?;

    let logits = ctx.pool().acquire(problem.logits_len() * ELEMENT_BYTES)?;
    let context = ctx.pool().acquire(problem.context_len() * ELEMENT_BYTES)?;
    let output = device.allocate(problem.context_len() * ELEMENT_BYTES)?;

    let buffers: Buffers<'_, D::Buffer> = Buffers {
        query: query.buffer,
        key: key.buffer,
        value: value.buffer,
        rpb: rpb.map(|bias| bias.buffer),
        logits: &logits,
        context: &context,
        output: &output,
    };
    let submitted = encode(&problem, &operands, &pipelines, &buffers)
        .and_then(|stream| device.submit(stream));
    drop(context);
    drop(logits);

    if let Err(e) = submitted {
        tracing::warn!(error = %e, "forward failed");
        device.free(output);
        return Err(e);
    }

    tracing::debug!(
        elapsed_us = started.elapsed().as_micros() as u64,
        "forward complete"
    );
    let shape = problem.output_shape();
    let strides = contiguous_strides(&shape);
    Ok(AttentionOutput {
        buffer: output,
        shape,
        strides,
    })
}

struct Buffers<'a, B> {
    query: &'a B,
    key: &'a B,
    value: &'a B,
    rpb: Option<&'a B>,
    logits: &'a B,
    context: &'a B,
    output: &'a B,
}

fn encode<'a, D: ComputeDevice>(
    problem: &Problem,
    operands: &Operands,
    pipelines: &Pipelines<'a, D>,
    buffers: &Buffers<'a, D::Buffer>,
) -> NattenResult<CommandStream<'a, D>> {
    let logits_layout = problem.logits_layout();
    let context_layout = problem.context_layout();
    let output_layout = problem.output_layout();
    let rpb = operands.rpb.as_ref();

    let qk_inputs = vec![
        Some(Binding::at(buffers.query, operands.query.offset)),
        Some(Binding::at(buffers.key, operands.key.offset)),
        buffers
            .rpb
            .zip(operands.rpb)
            .map(|(buffer, layout)| Binding::at(buffer, layout.offset)),
    ];
    let av_inputs = vec![
        Some(Binding::new(buffers.logits)),
        Some(Binding::at(buffers.value, operands.value.offset)),
    ];
    let permute_inputs = vec![Some(Binding::new(buffers.context))];

    let mut stream = CommandStream::new();
    match problem.rank {
        SpatialRank::One => {
            let qk = Na1dQkRpbParams::build(
                problem,
                &operands.query,
                &operands.key,
                rpb,
                &logits_layout,
            )?;
            let av =
                Na1dAvParams::build(problem, &logits_layout, &operands.value, &context_layout)?;
            let permute = PermuteReshape1dParams::build(problem, &context_layout, &output_layout)?;
            push(&mut stream, pipelines.qk, &qk, qk_inputs, buffers.logits);
            push(&mut stream, pipelines.av, &av, av_inputs, buffers.context);
            push(&mut stream, pipelines.permute, &permute, permute_inputs, buffers.output);
        }
        SpatialRank::Two => {
            let qk = Na2dQkRpbParams::build(
                problem,
                &operands.query,
                &operands.key,
                rpb,
                &logits_layout,
            )?;
            let av =
                Na2dAvParams::build(problem, &logits_layout, &operands.value, &context_layout)?;
            let permute = PermuteReshape2dParams::build(problem, &context_layout, &output_layout)?;
            push(&mut stream, pipelines.qk, &qk, qk_inputs, buffers.logits);
            push(&mut stream, pipelines.av, &av, av_inputs, buffers.context);
            push(&mut stream, pipelines.permute, &permute, permute_inputs, buffers.output);
        }
        SpatialRank::Three => {
            let qk = Na3dQkRpbParams::build(
                problem,
                &operands.query,
                &operands.key,
                rpb,
                &logits_layout,
            )?;
            let av =
                Na3dAvParams::build(problem, &logits_layout, &operands.value, &context_layout)?;
            let permute = PermuteReshape3dParams::build(problem, &context_layout, &output_layout)?;
            push(&mut stream, pipelines.qk, &qk, qk_inputs, buffers.logits);
            push(&mut stream, pipelines.av, &av, av_inputs, buffers.context);
            push(&mut stream, pipelines.permute, &permute, permute_inputs, buffers.output);
        }
    }
    Ok(stream)
}

fn push<'a, D: ComputeDevice, S: StageDescriptor>(
    stream: &mut CommandStream<'a, D>,
    pipeline: &'a D::Pipeline,
    descriptor: &S,
    inputs: Vec<Option<Binding<'a, D::Buffer>>>,
    output: &'a D::Buffer,
) {
    stream.encode(
        S::PROGRAM.entry_point(),
        pipeline,
        descriptor.grid(),
        descriptor,
        inputs,
        Binding::new(output),
    );
}
