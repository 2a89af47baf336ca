//! Host implementations of the neighborhood-attention programs
//!
//! Each program decodes its parameter block, lifts it to a volumetric plan
//! (unused leading axes have extent 1 and stride 0) and runs one of three
//! shared routines across the rayon pool. Every output element is computed
//! by a single task with a fixed summation order, so results are
//! bit-reproducible regardless of scheduling.

use bytemuck::Pod;
use rayon::prelude::*;

use crate::attention::descriptors::{
    Na1dAvParams, Na1dQkRpbParams, Na2dAvParams, Na2dQkRpbParams, Na3dAvParams, Na3dQkRpbParams,
    PermuteReshape1dParams, PermuteReshape2dParams, PermuteReshape3dParams,
};
use crate::attention::window::{rpb_index, AxisWindow};
use crate::backend::GridSize;
use crate::error::NattenResult;
use crate::execution_error;
use crate::kernels::{ProgramId, SpatialRank, Stage};

use super::KernelInvocation;

/// A host "compiled program"
pub type HostKernel = fn(&KernelInvocation<'_>, &mut [f32]) -> NattenResult<()>;

pub(crate) fn kernel_for(program: ProgramId) -> HostKernel {
    match (program.rank, program.stage) {
        (SpatialRank::One, Stage::QkRpb) => na1d_qkrpb,
        (SpatialRank::One, Stage::Av) => na1d_av,
        (SpatialRank::One, Stage::PermuteReshape) => permute_reshape_1d,
        (SpatialRank::Two, Stage::QkRpb) => na2d_qkrpb,
        (SpatialRank::Two, Stage::Av) => na2d_av,
        (SpatialRank::Two, Stage::PermuteReshape) => permute_reshape_2d,
        (SpatialRank::Three, Stage::QkRpb) => na3d_qkrpb,
        (SpatialRank::Three, Stage::Av) => na3d_av,
        (SpatialRank::Three, Stage::PermuteReshape) => permute_reshape_3d,
    }
}

fn decode<P: Pod>(params: &[u8]) -> NattenResult<P> {
    if params.len() != std::mem::size_of::<P>() {
        return Err(execution_error!(
            "parameter block is {} bytes, program expects {}",
            params.len(),
            std::mem::size_of::<P>()
        ));
    }
    Ok(bytemuck::pod_read_unaligned(params))
}

fn size(value: i32) -> NattenResult<usize> {
    usize::try_from(value).map_err(|_| execution_error!("negative extent {} in parameters", value))
}

fn sizes(values: [i32; 3]) -> NattenResult<[usize; 3]> {
    Ok([size(values[0])?, size(values[1])?, size(values[2])?])
}

/// Problem geometry with three spatial axes `[z, y, x]`
#[derive(Debug, Clone, Copy)]
struct Volume {
    batch: usize,
    heads: usize,
    dim: usize,
    extent: [usize; 3],
    original: [usize; 3],
    kernel: [usize; 3],
    dilation: [usize; 3],
    causal: bool,
}

impl Volume {
    #[allow(clippy::too_many_arguments)]
    fn new(
        batch: i32,
        heads: i32,
        dim: i32,
        extent: [i32; 3],
        original: [i32; 3],
        kernel: [i32; 3],
        dilation: [i32; 3],
        causal: i32,
    ) -> NattenResult<Self> {
        Ok(Volume {
            batch: size(batch)?,
            heads: size(heads)?,
            dim: size(dim)?,
            extent: sizes(extent)?,
            original: sizes(original)?,
            kernel: sizes(kernel)?,
            dilation: sizes(dilation)?,
            causal: causal != 0,
        })
    }

    fn positions(&self) -> usize {
        self.extent.iter().product()
    }

    fn slots(&self) -> usize {
        self.kernel.iter().product()
    }

    fn rows(&self) -> usize {
        self.batch * self.heads
    }

    fn coord(&self, position: usize) -> [usize; 3] {
        unravel(position, self.extent)
    }

    fn windows(&self, coord: [usize; 3]) -> [AxisWindow; 3] {
        [0, 1, 2].map(|a| {
            AxisWindow::derive(
                coord[a],
                self.original[a],
                self.kernel[a],
                self.dilation[a],
                self.causal,
            )
        })
    }

    /// Key coordinate of a window slot; `None` for an invalid causal slot
    fn key(&self, windows: &[AxisWindow; 3], slot: usize) -> Option<[usize; 3]> {
        let offsets = unravel(slot, self.kernel);
        Some([
            windows[0].position(offsets[0])?,
            windows[1].position(offsets[1])?,
            windows[2].position(offsets[2])?,
        ])
    }
}

fn unravel(index: usize, extent: [usize; 3]) -> [usize; 3] {
    let [_, ey, ex] = extent;
    [index / (ey * ex), (index / ex) % ey, index % ex]
}

/// Element strides of one tensor
#[derive(Debug, Clone, Copy)]
struct Strides {
    b: i64,
    h: i64,
    s: [i64; 3],
    inner: i64,
}

impl Strides {
    fn new(b: i32, h: i32, s: [i32; 3], inner: i32) -> Self {
        Strides {
            b: b as i64,
            h: h as i64,
            s: s.map(|v| v as i64),
            inner: inner as i64,
        }
    }

    fn at(&self, b: usize, h: usize, coord: [usize; 3], inner: usize) -> i64 {
        b as i64 * self.b
            + h as i64 * self.h
            + coord[0] as i64 * self.s[0]
            + coord[1] as i64 * self.s[1]
            + coord[2] as i64 * self.s[2]
            + inner as i64 * self.inner
    }
}

fn load(data: &[f32], offset: i64) -> NattenResult<f32> {
    usize::try_from(offset)
        .ok()
        .and_then(|i| data.get(i))
        .copied()
        .ok_or_else(|| {
            execution_error!(
                "read at element {} outside a bound buffer of {}",
                offset,
                data.len()
            )
        })
}

fn scatter(out: &mut [f32], writes: impl IntoIterator<Item = (i64, f32)>) -> NattenResult<()> {
    let len = out.len();
    for (offset, value) in writes {
        let slot = usize::try_from(offset)
            .ok()
            .and_then(|i| out.get_mut(i))
            .ok_or_else(|| {
                execution_error!("write at element {} outside a buffer of {}", offset, len)
            })?;
        *slot = value;
    }
    Ok(())
}

fn expect_grid(grid: GridSize, expected: GridSize) -> NattenResult<()> {
    if grid != expected {
        return Err(execution_error!(
            "dispatched grid {:?} does not match program grid {:?}",
            grid,
            expected
        ));
    }
    Ok(())
}

/// Stable softmax; `-inf` logits get exactly zero weight.
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f32> = logits
        .iter()
        .map(|&l| {
            if l == f32::NEG_INFINITY {
                0.0
            } else {
                (l - max).exp()
            }
        })
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

// ========== Shared routines ==========

struct QkPlan {
    volume: Volume,
    query: Strides,
    key: Strides,
    rpb: Option<Strides>,
    attn: Strides,
}

struct AvPlan {
    volume: Volume,
    attn: Strides,
    value: Strides,
    output: Strides,
}

struct PermutePlan {
    volume: Volume,
    context: Strides,
    output: Strides,
}

fn qk_rpb(plan: &QkPlan, inv: &KernelInvocation<'_>, attn: &mut [f32]) -> NattenResult<()> {
    let vol = plan.volume;
    let grid = inv.grid;
    expect_grid(grid, GridSize::new(vol.slots(), vol.positions(), vol.rows()))?;

    let query = inv.input(0)?;
    let key = inv.input(1)?;
    let rpb = match plan.rpb {
        Some(strides) => Some((inv.input(2)?, strides)),
        None => None,
    };

    let writes = (0..grid.threads())
        .into_par_iter()
        .map(|thread| {
            let (slot, position, row) = grid.unravel(thread);
            let (b, h) = (row / vol.heads, row % vol.heads);
            let coord = vol.coord(position);
            let target = plan.attn.at(b, h, coord, slot);

            let Some(key_coord) = vol.key(&vol.windows(coord), slot) else {
                return Ok((target, f32::NEG_INFINITY));
            };

            let mut logit = 0.0f32;
            for d in 0..vol.dim {
                logit += load(query, plan.query.at(b, h, coord, d))?
                    * load(key, plan.key.at(b, h, key_coord, d))?;
            }
            if let Some((bias, strides)) = rpb {
                let index = [0, 1, 2].map(|a| {
                    rpb_index(coord[a], key_coord[a], vol.kernel[a], vol.dilation[a])
                });
                logit += load(bias, strides.at(0, h, index, 0))?;
            }
            Ok((target, logit))
        })
        .collect::<NattenResult<Vec<_>>>()?;

    scatter(attn, writes)
}

fn av(plan: &AvPlan, inv: &KernelInvocation<'_>, output: &mut [f32]) -> NattenResult<()> {
    let vol = plan.volume;
    expect_grid(inv.grid, GridSize::new(vol.dim, vol.positions(), vol.rows()))?;

    let attn = inv.input(0)?;
    let value = inv.input(1)?;
    let positions = vol.positions();

    // One task per query row so the softmax is computed once per row.
    let rows = (0..vol.rows() * positions)
        .into_par_iter()
        .map(|task| {
            let (position, row) = (task % positions, task / positions);
            let (b, h) = (row / vol.heads, row % vol.heads);
            let coord = vol.coord(position);
            let windows = vol.windows(coord);

            let keys: Vec<Option<[usize; 3]>> =
                (0..vol.slots()).map(|slot| vol.key(&windows, slot)).collect();
            let logits = keys
                .iter()
                .enumerate()
                .map(|(slot, key)| match key {
                    Some(_) => load(attn, plan.attn.at(b, h, coord, slot)),
                    None => Ok(f32::NEG_INFINITY),
                })
                .collect::<NattenResult<Vec<_>>>()?;
            let weights = softmax(&logits);

            let mut out = Vec::with_capacity(vol.dim);
            for d in 0..vol.dim {
                let mut acc = 0.0f32;
                for (weight, key) in weights.iter().zip(&keys) {
                    if let Some(key_coord) = key {
                        acc += weight * load(value, plan.value.at(b, h, *key_coord, d))?;
                    }
                }
                out.push((plan.output.at(b, h, coord, d), acc));
            }
            Ok(out)
        })
        .collect::<NattenResult<Vec<_>>>()?;

    scatter(output, rows.into_iter().flatten())
}

fn permute_reshape(
    plan: &PermutePlan,
    inv: &KernelInvocation<'_>,
    output: &mut [f32],
) -> NattenResult<()> {
    let vol = plan.volume;
    let grid = inv.grid;
    expect_grid(grid, GridSize::new(vol.dim, vol.positions(), vol.rows()))?;

    let context = inv.input(0)?;
    let writes = (0..grid.threads())
        .into_par_iter()
        .map(|thread| {
            let (d, position, row) = grid.unravel(thread);
            let (b, h) = (row / vol.heads, row % vol.heads);
            let coord = vol.coord(position);
            Ok((
                plan.output.at(b, h, coord, d),
                load(context, plan.context.at(b, h, coord, d))?,
            ))
        })
        .collect::<NattenResult<Vec<_>>>()?;

    scatter(output, writes)
}

// ========== Entry points ==========

fn na1d_qkrpb(inv: &KernelInvocation<'_>, out: &mut [f32]) -> NattenResult<()> {
    let p: Na1dQkRpbParams = decode(inv.params)?;
    let plan = QkPlan {
        volume: Volume::new(
            p.batch_size,
            p.heads,
            p.dim,
            [1, 1, p.length],
            [1, 1, p.original_length],
            [1, 1, p.kernel_size],
            [1, 1, p.dilation],
            p.is_causal,
        )?,
        query: Strides::new(p.query_stride_b, p.query_stride_h, [0, 0, p.query_stride_l], p.query_stride_d),
        key: Strides::new(p.key_stride_b, p.key_stride_h, [0, 0, p.key_stride_l], p.key_stride_d),
        rpb: (p.has_rpb != 0).then(|| Strides::new(0, p.rpb_stride_h, [0, 0, p.rpb_stride_l], 0)),
        attn: Strides::new(p.attn_stride_b, p.attn_stride_h, [0, 0, p.attn_stride_l], p.attn_stride_k),
    };
    qk_rpb(&plan, inv, out)
}

fn na1d_av(inv: &KernelInvocation<'_>, out: &mut [f32]) -> NattenResult<()> {
    let p: Na1dAvParams = decode(inv.params)?;
    let plan = AvPlan {
        volume: Volume::new(
            p.batch_size,
            p.heads,
            p.dim,
            [1, 1, p.length],
            [1, 1, p.original_length],
            [1, 1, p.kernel_size],
            [1, 1, p.dilation],
            p.is_causal,
        )?,
        attn: Strides::new(p.attn_stride_b, p.attn_stride_h, [0, 0, p.attn_stride_l], p.attn_stride_k),
        value: Strides::new(p.value_stride_b, p.value_stride_h, [0, 0, p.value_stride_l], p.value_stride_d),
        output: Strides::new(p.output_stride_b, p.output_stride_h, [0, 0, p.output_stride_l], p.output_stride_d),
    };
    av(&plan, inv, out)
}

fn permute_reshape_1d(inv: &KernelInvocation<'_>, out: &mut [f32]) -> NattenResult<()> {
    let p: PermuteReshape1dParams = decode(inv.params)?;
    let plan = PermutePlan {
        volume: Volume::new(p.batch_size, p.heads, p.dim, [1, 1, p.length], [1, 1, p.length], [1; 3], [1; 3], 0)?,
        context: Strides::new(
            p.context_stride_b,
            p.context_stride_h,
            [0, 0, p.context_stride_l],
            p.context_stride_d,
        ),
        output: Strides::new(
            p.output_stride_b,
            p.dim * p.output_stride_d,
            [0, 0, p.output_stride_l],
            p.output_stride_d,
        ),
    };
    permute_reshape(&plan, inv, out)
}

fn na2d_qkrpb(inv: &KernelInvocation<'_>, out: &mut [f32]) -> NattenResult<()> {
    let p: Na2dQkRpbParams = decode(inv.params)?;
    let plan = QkPlan {
        volume: Volume::new(
            p.batch_size,
            p.heads,
            p.dim,
            [1, p.height, p.width],
            [1, p.original_height, p.original_width],
            [1, p.kernel_size, p.kernel_size],
            [1, p.dilation, p.dilation],
            p.is_causal,
        )?,
        query: Strides::new(
            p.query_stride_b,
            p.query_stride_h,
            [0, p.query_stride_y, p.query_stride_x],
            p.query_stride_d,
        ),
        key: Strides::new(
            p.key_stride_b,
            p.key_stride_h,
            [0, p.key_stride_y, p.key_stride_x],
            p.key_stride_d,
        ),
        rpb: (p.has_rpb != 0)
            .then(|| Strides::new(0, p.rpb_stride_h, [0, p.rpb_stride_y, p.rpb_stride_x], 0)),
        attn: Strides::new(
            p.attn_stride_b,
            p.attn_stride_h,
            [0, p.attn_stride_y, p.attn_stride_x],
            p.attn_stride_k,
        ),
    };
    qk_rpb(&plan, inv, out)
}

fn na2d_av(inv: &KernelInvocation<'_>, out: &mut [f32]) -> NattenResult<()> {
    let p: Na2dAvParams = decode(inv.params)?;
    let plan = AvPlan {
        volume: Volume::new(
            p.batch_size,
            p.heads,
            p.dim,
            [1, p.height, p.width],
            [1, p.original_height, p.original_width],
            [1, p.kernel_size, p.kernel_size],
            [1, p.dilation, p.dilation],
            p.is_causal,
        )?,
        attn: Strides::new(
            p.attn_stride_b,
            p.attn_stride_h,
            [0, p.attn_stride_y, p.attn_stride_x],
            p.attn_stride_k,
        ),
        value: Strides::new(
            p.value_stride_b,
            p.value_stride_h,
            [0, p.value_stride_y, p.value_stride_x],
            p.value_stride_d,
        ),
        output: Strides::new(
            p.output_stride_b,
            p.output_stride_h,
            [0, p.output_stride_y, p.output_stride_x],
            p.output_stride_d,
        ),
    };
    av(&plan, inv, out)
}

fn permute_reshape_2d(inv: &KernelInvocation<'_>, out: &mut [f32]) -> NattenResult<()> {
    let p: PermuteReshape2dParams = decode(inv.params)?;
    let extent = [1, p.height, p.width];
    let plan = PermutePlan {
        volume: Volume::new(p.batch_size, p.heads, p.dim, extent, extent, [1; 3], [1; 3], 0)?,
        context: Strides::new(
            p.context_stride_b,
            p.context_stride_h,
            [0, p.context_stride_y, p.context_stride_x],
            p.context_stride_d,
        ),
        output: Strides::new(
            p.output_stride_b,
            p.dim * p.output_stride_d,
            [0, p.output_stride_y, p.output_stride_x],
            p.output_stride_d,
        ),
    };
    permute_reshape(&plan, inv, out)
}

fn na3d_qkrpb(inv: &KernelInvocation<'_>, out: &mut [f32]) -> NattenResult<()> {
    let p: Na3dQkRpbParams = decode(inv.params)?;
    let plan = QkPlan {
        volume: Volume::new(
            p.batch_size,
            p.heads,
            p.dim,
            [p.depth, p.height, p.width],
            [p.original_depth, p.original_height, p.original_width],
            [p.kernel_size_d, p.kernel_size, p.kernel_size],
            [p.dilation_d, p.dilation, p.dilation],
            p.is_causal,
        )?,
        query: Strides::new(
            p.query_stride_b,
            p.query_stride_h,
            [p.query_stride_z, p.query_stride_y, p.query_stride_x],
            p.query_stride_d,
        ),
        key: Strides::new(
            p.key_stride_b,
            p.key_stride_h,
            [p.key_stride_z, p.key_stride_y, p.key_stride_x],
            p.key_stride_d,
        ),
        rpb: (p.has_rpb != 0).then(|| {
            Strides::new(
                0,
                p.rpb_stride_h,
                [p.rpb_stride_z, p.rpb_stride_y, p.rpb_stride_x],
                0,
            )
        }),
        attn: Strides::new(
            p.attn_stride_b,
            p.attn_stride_h,
            [p.attn_stride_z, p.attn_stride_y, p.attn_stride_x],
            p.attn_stride_k,
        ),
    };
    qk_rpb(&plan, inv, out)
}

fn na3d_av(inv: &KernelInvocation<'_>, out: &mut [f32]) -> NattenResult<()> {
    let p: Na3dAvParams = decode(inv.params)?;
    let plan = AvPlan {
        volume: Volume::new(
            p.batch_size,
            p.heads,
            p.dim,
            [p.depth, p.height, p.width],
            [p.original_depth, p.original_height, p.original_width],
            [p.kernel_size_d, p.kernel_size, p.kernel_size],
            [p.dilation_d, p.dilation, p.dilation],
            p.is_causal,
        )?,
        attn: Strides::new(
            p.attn_stride_b,
            p.attn_stride_h,
            [p.attn_stride_z, p.attn_stride_y, p.attn_stride_x],
            p.attn_stride_k,
        ),
        value: Strides::new(
            p.value_stride_b,
            p.value_stride_h,
            [p.value_stride_z, p.value_stride_y, p.value_stride_x],
            p.value_stride_d,
        ),
        output: Strides::new(
            p.output_stride_b,
            p.output_stride_h,
            [p.output_stride_z, p.output_stride_y, p.output_stride_x],
            p.output_stride_d,
        ),
    };
    av(&plan, inv, out)
}

fn permute_reshape_3d(inv: &KernelInvocation<'_>, out: &mut [f32]) -> NattenResult<()> {
    let p: PermuteReshape3dParams = decode(inv.params)?;
    let extent = [p.depth, p.height, p.width];
    let plan = PermutePlan {
        volume: Volume::new(p.batch_size, p.heads, p.dim, extent, extent, [1; 3], [1; 3], 0)?,
        context: Strides::new(
            p.context_stride_b,
            p.context_stride_h,
            [p.context_stride_z, p.context_stride_y, p.context_stride_x],
            p.context_stride_d,
        ),
        output: Strides::new(
            p.output_stride_b,
            p.dim * p.output_stride_d,
            [p.output_stride_z, p.output_stride_y, p.output_stride_x],
            p.output_stride_d,
        ),
    };
    permute_reshape(&plan, inv, out)
}
