//! Stride descriptors
//!
//! One `#[repr(C)]` parameter block per spatial rank and pipeline stage,
//! handed to the compute program as raw bytes. All fields are `i32`; strides
//! are in elements and fully determine each tensor's addressing:
//! `offset = sum(index_i * stride_i)`. Nothing here checks bounds; the
//! dispatcher validates the request before a descriptor is built.
//!
//! Axis suffixes: `_b` batch, `_h` head, `_l` length, `_z`/`_y`/`_x`
//! depth/height/width, `_d` channel, `_k` flattened window slot.

use bytemuck::{Pod, Zeroable};

use crate::backend::GridSize;
use crate::error::NattenResult;
use crate::invalid_argument;
use crate::kernels::{ProgramId, SpatialRank, Stage};

use super::problem::{Layout, Problem};

/// A parameter block bound to exactly one program
pub trait StageDescriptor: Pod {
    const PROGRAM: ProgramId;

    /// Thread space of the dispatch
    fn grid(&self) -> GridSize;
}

fn narrow<T>(value: T) -> NattenResult<i32>
where
    T: TryInto<i32> + Copy + std::fmt::Display,
{
    value
        .try_into()
        .map_err(|_| invalid_argument!("{} does not fit a 32-bit descriptor field", value))
}

fn extent(v: i32) -> usize {
    v.max(0) as usize
}

// ========== 1D ==========

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Na1dQkRpbParams {
    pub batch_size: i32,
    pub heads: i32,
    pub length: i32,
    pub original_length: i32,
    pub dim: i32,
    pub kernel_size: i32,
    pub dilation: i32,
    pub is_causal: i32,
    pub has_rpb: i32,
    pub query_stride_b: i32,
    pub query_stride_h: i32,
    pub query_stride_l: i32,
    pub query_stride_d: i32,
    pub key_stride_b: i32,
    pub key_stride_h: i32,
    pub key_stride_l: i32,
    pub key_stride_d: i32,
    pub rpb_stride_h: i32,
    pub rpb_stride_l: i32,
    pub attn_stride_b: i32,
    pub attn_stride_h: i32,
    pub attn_stride_l: i32,
    pub attn_stride_k: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Na1dAvParams {
    pub batch_size: i32,
    pub heads: i32,
    pub length: i32,
    pub original_length: i32,
    pub dim: i32,
    pub kernel_size: i32,
    pub dilation: i32,
    pub is_causal: i32,
    pub attn_stride_b: i32,
    pub attn_stride_h: i32,
    pub attn_stride_l: i32,
    pub attn_stride_k: i32,
    pub value_stride_b: i32,
    pub value_stride_h: i32,
    pub value_stride_l: i32,
    pub value_stride_d: i32,
    pub output_stride_b: i32,
    pub output_stride_h: i32,
    pub output_stride_l: i32,
    pub output_stride_d: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PermuteReshape1dParams {
    pub batch_size: i32,
    pub heads: i32,
    pub length: i32,
    pub dim: i32,
    pub context_stride_b: i32,
    pub context_stride_h: i32,
    pub context_stride_l: i32,
    pub context_stride_d: i32,
    pub output_stride_b: i32,
    pub output_stride_l: i32,
    pub output_stride_d: i32,
}

impl Na1dQkRpbParams {
    pub(crate) fn build(
        p: &Problem,
        query: &Layout,
        key: &Layout,
        rpb: Option<&Layout>,
        attn: &Layout,
    ) -> NattenResult<Self> {
        let bias = rpb.copied().unwrap_or_default();
        Ok(Na1dQkRpbParams {
            batch_size: narrow(p.batch)?,
            heads: narrow(p.heads)?,
            length: narrow(p.extent[2])?,
            original_length: narrow(p.original[2])?,
            dim: narrow(p.dim)?,
            kernel_size: narrow(p.kernel[2])?,
            dilation: narrow(p.dilation[2])?,
            is_causal: p.causal as i32,
            has_rpb: rpb.is_some() as i32,
            query_stride_b: narrow(query.batch)?,
            query_stride_h: narrow(query.head)?,
            query_stride_l: narrow(query.spatial[2])?,
            query_stride_d: narrow(query.inner)?,
            key_stride_b: narrow(key.batch)?,
            key_stride_h: narrow(key.head)?,
            key_stride_l: narrow(key.spatial[2])?,
            key_stride_d: narrow(key.inner)?,
            rpb_stride_h: narrow(bias.head)?,
            rpb_stride_l: narrow(bias.spatial[2])?,
            attn_stride_b: narrow(attn.batch)?,
            attn_stride_h: narrow(attn.head)?,
            attn_stride_l: narrow(attn.spatial[2])?,
            attn_stride_k: narrow(attn.inner)?,
        })
    }
}

impl StageDescriptor for Na1dQkRpbParams {
    const PROGRAM: ProgramId = ProgramId::new(SpatialRank::One, Stage::QkRpb);

    fn grid(&self) -> GridSize {
        GridSize::new(
            extent(self.kernel_size),
            extent(self.length),
            extent(self.batch_size) * extent(self.heads),
        )
    }
}

impl Na1dAvParams {
    pub(crate) fn build(
        p: &Problem,
        attn: &Layout,
        value: &Layout,
        output: &Layout,
    ) -> NattenResult<Self> {
        Ok(Na1dAvParams {
            batch_size: narrow(p.batch)?,
            heads: narrow(p.heads)?,
            length: narrow(p.extent[2])?,
            original_length: narrow(p.original[2])?,
            dim: narrow(p.dim)?,
            kernel_size: narrow(p.kernel[2])?,
            dilation: narrow(p.dilation[2])?,
            is_causal: p.causal as i32,
            attn_stride_b: narrow(attn.batch)?,
            attn_stride_h: narrow(attn.head)?,
            attn_stride_l: narrow(attn.spatial[2])?,
            attn_stride_k: narrow(attn.inner)?,
            value_stride_b: narrow(value.batch)?,
            value_stride_h: narrow(value.head)?,
            value_stride_l: narrow(value.spatial[2])?,
            value_stride_d: narrow(value.inner)?,
            output_stride_b: narrow(output.batch)?,
            output_stride_h: narrow(output.head)?,
            output_stride_l: narrow(output.spatial[2])?,
            output_stride_d: narrow(output.inner)?,
        })
    }
}

impl StageDescriptor for Na1dAvParams {
    const PROGRAM: ProgramId = ProgramId::new(SpatialRank::One, Stage::Av);

    fn grid(&self) -> GridSize {
        GridSize::new(
            extent(self.dim),
            extent(self.length),
            extent(self.batch_size) * extent(self.heads),
        )
    }
}

impl PermuteReshape1dParams {
    pub(crate) fn build(p: &Problem, context: &Layout, output: &Layout) -> NattenResult<Self> {
        Ok(PermuteReshape1dParams {
            batch_size: narrow(p.batch)?,
            heads: narrow(p.heads)?,
            length: narrow(p.extent[2])?,
            dim: narrow(p.dim)?,
            context_stride_b: narrow(context.batch)?,
            context_stride_h: narrow(context.head)?,
            context_stride_l: narrow(context.spatial[2])?,
            context_stride_d: narrow(context.inner)?,
            output_stride_b: narrow(output.batch)?,
            output_stride_l: narrow(output.spatial[2])?,
            output_stride_d: narrow(output.inner)?,
        })
    }
}

impl StageDescriptor for PermuteReshape1dParams {
    const PROGRAM: ProgramId = ProgramId::new(SpatialRank::One, Stage::PermuteReshape);

    fn grid(&self) -> GridSize {
        GridSize::new(
            extent(self.dim),
            extent(self.length),
            extent(self.batch_size) * extent(self.heads),
        )
    }
}

// ========== 2D ==========

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Na2dQkRpbParams {
    pub batch_size: i32,
    pub heads: i32,
    pub height: i32,
    pub width: i32,
    pub original_height: i32,
    pub original_width: i32,
    pub dim: i32,
    pub kernel_size: i32,
    pub dilation: i32,
    pub is_causal: i32,
    pub has_rpb: i32,
    pub query_stride_b: i32,
    pub query_stride_h: i32,
    pub query_stride_y: i32,
    pub query_stride_x: i32,
    pub query_stride_d: i32,
    pub key_stride_b: i32,
    pub key_stride_h: i32,
    pub key_stride_y: i32,
    pub key_stride_x: i32,
    pub key_stride_d: i32,
    pub rpb_stride_h: i32,
    pub rpb_stride_y: i32,
    pub rpb_stride_x: i32,
    pub attn_stride_b: i32,
    pub attn_stride_h: i32,
    pub attn_stride_y: i32,
    pub attn_stride_x: i32,
    pub attn_stride_k: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Na2dAvParams {
    pub batch_size: i32,
    pub heads: i32,
    pub height: i32,
    pub width: i32,
    pub original_height: i32,
    pub original_width: i32,
    pub dim: i32,
    pub kernel_size: i32,
    pub dilation: i32,
    pub is_causal: i32,
    pub attn_stride_b: i32,
    pub attn_stride_h: i32,
    pub attn_stride_y: i32,
    pub attn_stride_x: i32,
    pub attn_stride_k: i32,
    pub value_stride_b: i32,
    pub value_stride_h: i32,
    pub value_stride_y: i32,
    pub value_stride_x: i32,
    pub value_stride_d: i32,
    pub output_stride_b: i32,
    pub output_stride_h: i32,
    pub output_stride_y: i32,
    pub output_stride_x: i32,
    pub output_stride_d: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PermuteReshape2dParams {
    pub batch_size: i32,
    pub heads: i32,
    pub height: i32,
    pub width: i32,
    pub dim: i32,
    pub context_stride_b: i32,
    pub context_stride_h: i32,
    pub context_stride_y: i32,
    pub context_stride_x: i32,
    pub context_stride_d: i32,
    pub output_stride_b: i32,
    pub output_stride_y: i32,
    pub output_stride_x: i32,
    pub output_stride_d: i32,
}

impl Na2dQkRpbParams {
    pub(crate) fn build(
        p: &Problem,
        query: &Layout,
        key: &Layout,
        rpb: Option<&Layout>,
        attn: &Layout,
    ) -> NattenResult<Self> {
        let bias = rpb.copied().unwrap_or_default();
        Ok(Na2dQkRpbParams {
            batch_size: narrow(p.batch)?,
            heads: narrow(p.heads)?,
            height: narrow(p.extent[1])?,
            width: narrow(p.extent[2])?,
            original_height: narrow(p.original[1])?,
            original_width: narrow(p.original[2])?,
            dim: narrow(p.dim)?,
            kernel_size: narrow(p.kernel[2])?,
            dilation: narrow(p.dilation[2])?,
            is_causal: p.causal as i32,
            has_rpb: rpb.is_some() as i32,
            query_stride_b: narrow(query.batch)?,
            query_stride_h: narrow(query.head)?,
            query_stride_y: narrow(query.spatial[1])?,
            query_stride_x: narrow(query.spatial[2])?,
            query_stride_d: narrow(query.inner)?,
            key_stride_b: narrow(key.batch)?,
            key_stride_h: narrow(key.head)?,
            key_stride_y: narrow(key.spatial[1])?,
            key_stride_x: narrow(key.spatial[2])?,
            key_stride_d: narrow(key.inner)?,
            rpb_stride_h: narrow(bias.head)?,
            rpb_stride_y: narrow(bias.spatial[1])?,
            rpb_stride_x: narrow(bias.spatial[2])?,
            attn_stride_b: narrow(attn.batch)?,
            attn_stride_h: narrow(attn.head)?,
            attn_stride_y: narrow(attn.spatial[1])?,
            attn_stride_x: narrow(attn.spatial[2])?,
            attn_stride_k: narrow(attn.inner)?,
        })
    }
}

impl StageDescriptor for Na2dQkRpbParams {
    const PROGRAM: ProgramId = ProgramId::new(SpatialRank::Two, Stage::QkRpb);

    fn grid(&self) -> GridSize {
        let k = extent(self.kernel_size);
        GridSize::new(
            k * k,
            extent(self.height) * extent(self.width),
            extent(self.batch_size) * extent(self.heads),
        )
    }
}

impl Na2dAvParams {
    pub(crate) fn build(
        p: &Problem,
        attn: &Layout,
        value: &Layout,
        output: &Layout,
    ) -> NattenResult<Self> {
        Ok(Na2dAvParams {
            batch_size: narrow(p.batch)?,
            heads: narrow(p.heads)?,
            height: narrow(p.extent[1])?,
            width: narrow(p.extent[2])?,
            original_height: narrow(p.original[1])?,
            original_width: narrow(p.original[2])?,
            dim: narrow(p.dim)?,
            kernel_size: narrow(p.kernel[2])?,
            dilation: narrow(p.dilation[2])?,
            is_causal: p.causal as i32,
            attn_stride_b: narrow(attn.batch)?,
            attn_stride_h: narrow(attn.head)?,
            attn_stride_y: narrow(attn.spatial[1])?,
            attn_stride_x: narrow(attn.spatial[2])?,
            attn_stride_k: narrow(attn.inner)?,
            value_stride_b: narrow(value.batch)?,
            value_stride_h: narrow(value.head)?,
            value_stride_y: narrow(value.spatial[1])?,
            value_stride_x: narrow(value.spatial[2])?,
            value_stride_d: narrow(value.inner)?,
            output_stride_b: narrow(output.batch)?,
            output_stride_h: narrow(output.head)?,
            output_stride_y: narrow(output.spatial[1])?,
            output_stride_x: narrow(output.spatial[2])?,
            output_stride_d: narrow(output.inner)?,
        })
    }
}

impl StageDescriptor for Na2dAvParams {
    const PROGRAM: ProgramId = ProgramId::new(SpatialRank::Two, Stage::Av);

    fn grid(&self) -> GridSize {
        GridSize::new(
            extent(self.dim),
            extent(self.height) * extent(self.width),
            extent(self.batch_size) * extent(self.heads),
        )
    }
}

impl PermuteReshape2dParams {
    pub(crate) fn build(p: &Problem, context: &Layout, output: &Layout) -> NattenResult<Self> {
        Ok(PermuteReshape2dParams {
            batch_size: narrow(p.batch)?,
            heads: narrow(p.heads)?,
            height: narrow(p.extent[1])?,
            width: narrow(p.extent[2])?,
            dim: narrow(p.dim)?,
            context_stride_b: narrow(context.batch)?,
            context_stride_h: narrow(context.head)?,
            context_stride_y: narrow(context.spatial[1])?,
            context_stride_x: narrow(context.spatial[2])?,
            context_stride_d: narrow(context.inner)?,
            output_stride_b: narrow(output.batch)?,
            output_stride_y: narrow(output.spatial[1])?,
            output_stride_x: narrow(output.spatial[2])?,
            output_stride_d: narrow(output.inner)?,
        })
    }
}

impl StageDescriptor for PermuteReshape2dParams {
    const PROGRAM: ProgramId = ProgramId::new(SpatialRank::Two, Stage::PermuteReshape);

    fn grid(&self) -> GridSize {
        GridSize::new(
            extent(self.dim),
            extent(self.height) * extent(self.width),
            extent(self.batch_size) * extent(self.heads),
        )
    }
}

// ========== 3D ==========

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Na3dQkRpbParams {
    pub batch_size: i32,
    pub heads: i32,
    pub depth: i32,
    pub height: i32,
    pub width: i32,
    pub original_depth: i32,
    pub original_height: i32,
    pub original_width: i32,
    pub dim: i32,
    pub kernel_size_d: i32,
    pub kernel_size: i32,
    pub dilation_d: i32,
    pub dilation: i32,
    pub is_causal: i32,
    pub has_rpb: i32,
    pub query_stride_b: i32,
    pub query_stride_h: i32,
    pub query_stride_z: i32,
    pub query_stride_y: i32,
    pub query_stride_x: i32,
    pub query_stride_d: i32,
    pub key_stride_b: i32,
    pub key_stride_h: i32,
    pub key_stride_z: i32,
    pub key_stride_y: i32,
    pub key_stride_x: i32,
    pub key_stride_d: i32,
    pub rpb_stride_h: i32,
    pub rpb_stride_z: i32,
    pub rpb_stride_y: i32,
    pub rpb_stride_x: i32,
    pub attn_stride_b: i32,
    pub attn_stride_h: i32,
    pub attn_stride_z: i32,
    pub attn_stride_y: i32,
    pub attn_stride_x: i32,
    pub attn_stride_k: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Na3dAvParams {
    pub batch_size: i32,
    pub heads: i32,
    pub depth: i32,
    pub height: i32,
    pub width: i32,
    pub original_depth: i32,
    pub original_height: i32,
    pub original_width: i32,
    pub dim: i32,
    pub kernel_size_d: i32,
    pub kernel_size: i32,
    pub dilation_d: i32,
    pub dilation: i32,
    pub is_causal: i32,
    pub attn_stride_b: i32,
    pub attn_stride_h: i32,
    pub attn_stride_z: i32,
    pub attn_stride_y: i32,
    pub attn_stride_x: i32,
    pub attn_stride_k: i32,
    pub value_stride_b: i32,
    pub value_stride_h: i32,
    pub value_stride_z: i32,
    pub value_stride_y: i32,
    pub value_stride_x: i32,
    pub value_stride_d: i32,
    pub output_stride_b: i32,
    pub output_stride_h: i32,
    pub output_stride_z: i32,
    pub output_stride_y: i32,
    pub output_stride_x: i32,
    pub output_stride_d: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PermuteReshape3dParams {
    pub batch_size: i32,
    pub heads: i32,
    pub depth: i32,
    pub height: i32,
    pub width: i32,
    pub dim: i32,
    pub context_stride_b: i32,
    pub context_stride_h: i32,
    pub context_stride_z: i32,
    pub context_stride_y: i32,
    pub context_stride_x: i32,
    pub context_stride_d: i32,
    pub output_stride_b: i32,
    pub output_stride_z: i32,
    pub output_stride_y: i32,
    pub output_stride_x: i32,
    pub output_stride_d: i32,
}

impl Na3dQkRpbParams {
    pub(crate) fn build(
        p: &Problem,
        query: &Layout,
        key: &Layout,
        rpb: Option<&Layout>,
        attn: &Layout,
    ) -> NattenResult<Self> {
        let bias = rpb.copied().unwrap_or_default();
        Ok(Na3dQkRpbParams {
            batch_size: narrow(p.batch)?,
            heads: narrow(p.heads)?,
            depth: narrow(p.extent[0])?,
            height: narrow(p.extent[1])?,
            width: narrow(p.extent[2])?,
            original_depth: narrow(p.original[0])?,
            original_height: narrow(p.original[1])?,
            original_width: narrow(p.original[2])?,
            dim: narrow(p.dim)?,
            kernel_size_d: narrow(p.kernel[0])?,
            kernel_size: narrow(p.kernel[2])?,
            dilation_d: narrow(p.dilation[0])?,
            dilation: narrow(p.dilation[2])?,
            is_causal: p.causal as i32,
            has_rpb: rpb.is_some() as i32,
            query_stride_b: narrow(query.batch)?,
            query_stride_h: narrow(query.head)?,
            query_stride_z: narrow(query.spatial[0])?,
            query_stride_y: narrow(query.spatial[1])?,
            query_stride_x: narrow(query.spatial[2])?,
            query_stride_d: narrow(query.inner)?,
            key_stride_b: narrow(key.batch)?,
            key_stride_h: narrow(key.head)?,
            key_stride_z: narrow(key.spatial[0])?,
            key_stride_y: narrow(key.spatial[1])?,
            key_stride_x: narrow(key.spatial[2])?,
            key_stride_d: narrow(key.inner)?,
            rpb_stride_h: narrow(bias.head)?,
            rpb_stride_z: narrow(bias.spatial[0])?,
            rpb_stride_y: narrow(bias.spatial[1])?,
            rpb_stride_x: narrow(bias.spatial[2])?,
            attn_stride_b: narrow(attn.batch)?,
            attn_stride_h: narrow(attn.head)?,
            attn_stride_z: narrow(attn.spatial[0])?,
            attn_stride_y: narrow(attn.spatial[1])?,
            attn_stride_x: narrow(attn.spatial[2])?,
            attn_stride_k: narrow(attn.inner)?,
        })
    }
}

impl StageDescriptor for Na3dQkRpbParams {
    const PROGRAM: ProgramId = ProgramId::new(SpatialRank::Three, Stage::QkRpb);

    fn grid(&self) -> GridSize {
        let k = extent(self.kernel_size);
        GridSize::new(
            extent(self.kernel_size_d) * k * k,
            extent(self.depth) * extent(self.height) * extent(self.width),
            extent(self.batch_size) * extent(self.heads),
        )
    }
}

impl Na3dAvParams {
    pub(crate) fn build(
        p: &Problem,
        attn: &Layout,
        value: &Layout,
        output: &Layout,
    ) -> NattenResult<Self> {
        Ok(Na3dAvParams {
            batch_size: narrow(p.batch)?,
            heads: narrow(p.heads)?,
            depth: narrow(p.extent[0])?,
            height: narrow(p.extent[1])?,
            width: narrow(p.extent[2])?,
            original_depth: narrow(p.original[0])?,
            original_height: narrow(p.original[1])?,
            original_width: narrow(p.original[2])?,
            dim: narrow(p.dim)?,
            kernel_size_d: narrow(p.kernel[0])?,
            kernel_size: narrow(p.kernel[2])?,
            dilation_d: narrow(p.dilation[0])?,
            dilation: narrow(p.dilation[2])?,
            is_causal: p.causal as i32,
            attn_stride_b: narrow(attn.batch)?,
            attn_stride_h: narrow(attn.head)?,
            attn_stride_z: narrow(attn.spatial[0])?,
            attn_stride_y: narrow(attn.spatial[1])?,
            attn_stride_x: narrow(attn.spatial[2])?,
            attn_stride_k: narrow(attn.inner)?,
            value_stride_b: narrow(value.batch)?,
            value_stride_h: narrow(value.head)?,
            value_stride_z: narrow(value.spatial[0])?,
            value_stride_y: narrow(value.spatial[1])?,
            value_stride_x: narrow(value.spatial[2])?,
            value_stride_d: narrow(value.inner)?,
            output_stride_b: narrow(output.batch)?,
            output_stride_h: narrow(output.head)?,
            output_stride_z: narrow(output.spatial[0])?,
            output_stride_y: narrow(output.spatial[1])?,
            output_stride_x: narrow(output.spatial[2])?,
            output_stride_d: narrow(output.inner)?,
        })
    }
}

impl StageDescriptor for Na3dAvParams {
    const PROGRAM: ProgramId = ProgramId::new(SpatialRank::Three, Stage::Av);

    fn grid(&self) -> GridSize {
        GridSize::new(
            extent(self.dim),
            extent(self.depth) * extent(self.height) * extent(self.width),
            extent(self.batch_size) * extent(self.heads),
        )
    }
}

impl PermuteReshape3dParams {
    pub(crate) fn build(p: &Problem, context: &Layout, output: &Layout) -> NattenResult<Self> {
        Ok(PermuteReshape3dParams {
            batch_size: narrow(p.batch)?,
            heads: narrow(p.heads)?,
            depth: narrow(p.extent[0])?,
            height: narrow(p.extent[1])?,
            width: narrow(p.extent[2])?,
            dim: narrow(p.dim)?,
            context_stride_b: narrow(context.batch)?,
            context_stride_h: narrow(context.head)?,
            context_stride_z: narrow(context.spatial[0])?,
            context_stride_y: narrow(context.spatial[1])?,
            context_stride_x: narrow(context.spatial[2])?,
            context_stride_d: narrow(context.inner)?,
            output_stride_b: narrow(output.batch)?,
            output_stride_z: narrow(output.spatial[0])?,
            output_stride_y: narrow(output.spatial[1])?,
            output_stride_x: narrow(output.spatial[2])?,
            output_stride_d: narrow(output.inner)?,
        })
    }
}

impl StageDescriptor for PermuteReshape3dParams {
    const PROGRAM: ProgramId = ProgramId::new(SpatialRank::Three, Stage::PermuteReshape);

    fn grid(&self) -> GridSize {
        GridSize::new(
            extent(self.dim),
            extent(self.depth) * extent(self.height) * extent(self.width),
            extent(self.batch_size) * extent(self.heads),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem_1d() -> Problem {
        Problem {
            rank: SpatialRank::One,
            batch: 2,
            heads: 3,
            dim: 4,
            extent: [1, 1, 8],
            original: [1, 1, 7],
            kernel: [1, 1, 3],
            dilation: [1, 1, 2],
            causal: true,
        }
    }

    #[test]
    fn test_1d_qk_descriptor_fields() {
        let p = problem_1d();
        let q = Layout {
            batch: 96,
            head: 32,
            spatial: [0, 0, 4],
            inner: 1,
            offset: 0,
        };
        let attn = p.logits_layout();
        let desc = Na1dQkRpbParams::build(&p, &q, &q, None, &attn).unwrap();

        assert_eq!(desc.length, 8);
        assert_eq!(desc.original_length, 7);
        assert_eq!(desc.kernel_size, 3);
        assert_eq!(desc.dilation, 2);
        assert_eq!(desc.is_causal, 1);
        assert_eq!(desc.has_rpb, 0);
        assert_eq!(desc.query_stride_l, 4);
        assert_eq!(desc.attn_stride_k, 1);
        assert_eq!(desc.attn_stride_l, 3);
        assert_eq!(desc.attn_stride_h, 24);
        assert_eq!(desc.attn_stride_b, 72);
        assert_eq!(desc.grid(), GridSize::new(3, 8, 6));
    }

    #[test]
    fn test_descriptor_bytes_are_packed_i32() {
        assert_eq!(std::mem::size_of::<Na1dQkRpbParams>(), 23 * 4);
        assert_eq!(std::mem::size_of::<PermuteReshape2dParams>(), 14 * 4);
        assert_eq!(std::mem::size_of::<Na3dAvParams>(), 32 * 4);

        let p = problem_1d();
        let desc =
            PermuteReshape1dParams::build(&p, &p.context_layout(), &p.output_layout()).unwrap();
        let bytes = bytemuck::bytes_of(&desc);
        let decoded: PermuteReshape1dParams = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(decoded, desc);
        assert_eq!(decoded.output_stride_l, 12);
        assert_eq!(decoded.output_stride_b, 96);
    }

    #[test]
    fn test_oversized_stride_rejected() {
        let p = problem_1d();
        let huge = Layout {
            batch: i64::from(i32::MAX) + 1,
            ..Layout::default()
        };
        assert!(Na1dAvParams::build(&p, &huge, &huge, &huge).is_err());
    }

    #[test]
    fn test_3d_grids() {
        let p = Problem {
            rank: SpatialRank::Three,
            batch: 1,
            heads: 2,
            dim: 5,
            extent: [3, 4, 6],
            original: [3, 4, 6],
            kernel: [3, 3, 3],
            dilation: [1, 1, 1],
            causal: false,
        };
        let l = p.context_layout();
        let qk = Na3dQkRpbParams::build(&p, &l, &l, None, &p.logits_layout()).unwrap();
        assert_eq!(qk.grid(), GridSize::new(27, 72, 2));

        let av = Na3dAvParams::build(&p, &p.logits_layout(), &l, &l).unwrap();
        assert_eq!(av.grid(), GridSize::new(5, 72, 2));
        assert_eq!(av.value_stride_z, 5 * 4 * 6);
    }
}
