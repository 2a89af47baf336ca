//! Request validation and problem geometry
//!
//! Everything a dispatch needs is checked here, before the device is
//! touched. Internally every problem is volumetric: spatial axes are stored
//! as `[depth, height, width]` with the caller's axes right-aligned and the
//! unused leading axes of extent 1 (kernel 1, dilation 1, stride 0).

use crate::error::NattenResult;
use crate::invalid_argument;
use crate::kernels::SpatialRank;

use super::{Na1dParams, Na2dParams, Na3dParams, TensorRef};

/// Hyperparameters normalized to three axes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Hyper {
    pub rank: SpatialRank,
    pub kernel: [usize; 3],
    pub dilation: [usize; 3],
    pub original: [Option<usize>; 3],
    pub causal: bool,
}

impl From<&Na1dParams> for Hyper {
    fn from(p: &Na1dParams) -> Self {
        Hyper {
            rank: SpatialRank::One,
            kernel: [1, 1, p.kernel_size],
            dilation: [1, 1, p.dilation],
            original: [None, None, p.original_length],
            causal: p.is_causal,
        }
    }
}

impl From<&Na2dParams> for Hyper {
    fn from(p: &Na2dParams) -> Self {
        Hyper {
            rank: SpatialRank::Two,
            kernel: [1, p.kernel_size, p.kernel_size],
            dilation: [1, p.dilation, p.dilation],
            original: [None, p.original_height, p.original_width],
            causal: p.is_causal,
        }
    }
}

impl From<&Na3dParams> for Hyper {
    fn from(p: &Na3dParams) -> Self {
        Hyper {
            rank: SpatialRank::Three,
            kernel: [p.kernel_size_d, p.kernel_size, p.kernel_size],
            dilation: [p.dilation_d, p.dilation, p.dilation],
            original: [p.original_depth, p.original_height, p.original_width],
            causal: p.is_causal,
        }
    }
}

/// Validated geometry of one attention request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Problem {
    pub rank: SpatialRank,
    pub batch: usize,
    pub heads: usize,
    pub dim: usize,
    pub extent: [usize; 3],
    pub original: [usize; 3],
    pub kernel: [usize; 3],
    pub dilation: [usize; 3],
    pub causal: bool,
}

/// Element strides of one operand, axes normalized like [`Problem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Layout {
    pub batch: i64,
    pub head: i64,
    pub spatial: [i64; 3],
    /// Channel stride, or window-slot stride for logits
    pub inner: i64,
    /// Element offset of the first element within its buffer
    pub offset: usize,
}

/// Layouts of the caller's tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Operands {
    pub query: Layout,
    pub key: Layout,
    pub value: Layout,
    pub rpb: Option<Layout>,
}

impl Problem {
    /// Query positions per (batch, head)
    pub fn positions(&self) -> usize {
        self.extent.iter().product()
    }

    /// Window slots per query
    pub fn slots(&self) -> usize {
        self.kernel.iter().product()
    }

    pub fn logits_len(&self) -> usize {
        self.batch * self.heads * self.positions() * self.slots()
    }

    pub fn context_len(&self) -> usize {
        self.batch * self.heads * self.positions() * self.dim
    }

    /// Dense `[B, H, spatial..., slots]`
    pub fn logits_layout(&self) -> Layout {
        self.head_major(self.slots())
    }

    /// Dense `[B, H, spatial..., D]`
    pub fn context_layout(&self) -> Layout {
        self.head_major(self.dim)
    }

    /// Dense `[B, spatial..., H*D]`; `head` is the channel offset of a head
    pub fn output_layout(&self) -> Layout {
        let channels = (self.heads * self.dim) as i64;
        let [_, ey, ex] = self.extent.map(|e| e as i64);
        Layout {
            batch: channels * self.positions() as i64,
            head: self.dim as i64,
            spatial: [channels * ex * ey, channels * ex, channels],
            inner: 1,
            offset: 0,
        }
    }

    pub fn output_shape(&self) -> Vec<usize> {
        let axes = self.rank.axes();
        let mut shape = Vec::with_capacity(axes + 2);
        shape.push(self.batch);
        shape.extend_from_slice(&self.extent[3 - axes..]);
        shape.push(self.heads * self.dim);
        shape
    }

    fn head_major(&self, inner: usize) -> Layout {
        let inner = inner as i64;
        let [_, ey, ex] = self.extent.map(|e| e as i64);
        let per_head = inner * self.positions() as i64;
        Layout {
            batch: per_head * self.heads as i64,
            head: per_head,
            spatial: [inner * ex * ey, inner * ex, inner],
            inner: 1,
            offset: 0,
        }
    }
}

fn axis_names(rank: SpatialRank) -> &'static [&'static str] {
    match rank {
        SpatialRank::One => &["batch", "heads", "length", "dim"],
        SpatialRank::Two => &["batch", "heads", "height", "width", "dim"],
        SpatialRank::Three => &["batch", "heads", "depth", "height", "width", "dim"],
    }
}

/// Validate a request and derive its geometry.
///
/// `capacity` reports a buffer's size in elements.
pub(crate) fn resolve<B>(
    hyper: Hyper,
    query: &TensorRef<'_, B>,
    key: &TensorRef<'_, B>,
    value: &TensorRef<'_, B>,
    rpb: Option<&TensorRef<'_, B>>,
    capacity: impl Fn(&B) -> usize,
) -> NattenResult<(Problem, Operands)> {
    let axes = hyper.rank.axes();
    let rank = axes + 3;

    check_operand("query", query, rank, capacity(query.buffer))?;
    check_operand("key", key, rank, capacity(key.buffer))?;
    check_operand("value", value, rank, capacity(value.buffer))?;

    let names = axis_names(hyper.rank);
    for (name, other) in [("key", key), ("value", value)] {
        for (axis, (&expected, &actual)) in query.shape.iter().zip(&other.shape).enumerate() {
            if expected != actual {
                return Err(invalid_argument!(
                    "{} {} {} does not match query {} {}",
                    name,
                    names[axis],
                    actual,
                    names[axis],
                    expected
                ));
            }
        }
    }

    let mut extent = [1usize; 3];
    extent[3 - axes..].copy_from_slice(&query.shape[2..2 + axes]);

    let mut original = [1usize; 3];
    for axis in 3 - axes..3 {
        let name = names[axis + axes - 1];
        let k = hyper.kernel[axis];
        let d = hyper.dilation[axis];
        if k < 1 {
            return Err(invalid_argument!("{} kernel size must be >= 1, got {}", name, k));
        }
        if d < 1 {
            return Err(invalid_argument!("{} dilation must be >= 1, got {}", name, d));
        }

        let orig = hyper.original[axis].unwrap_or(extent[axis]);
        if orig == 0 || orig > extent[axis] {
            return Err(invalid_argument!(
                "original {} {} must be in 1..={}",
                name,
                orig,
                extent[axis]
            ));
        }

        let span = (k - 1)
            .checked_mul(d)
            .and_then(|s| s.checked_add(1))
            .ok_or_else(|| invalid_argument!("{} window span overflows", name))?;
        if span > orig {
            return Err(invalid_argument!(
                "{} window span {} (kernel {}, dilation {}) exceeds {} {}",
                name,
                span,
                k,
                d,
                name,
                orig
            ));
        }
        original[axis] = orig;
    }

    let problem = Problem {
        rank: hyper.rank,
        batch: query.shape[0],
        heads: query.shape[1],
        dim: query.shape[rank - 1],
        extent,
        original,
        kernel: hyper.kernel,
        dilation: hyper.dilation,
        causal: hyper.causal,
    };

    let rpb = match rpb {
        Some(bias) => {
            check_operand("rpb", bias, axes + 1, capacity(bias.buffer))?;
            let mut expected = vec![problem.heads];
            expected.extend(problem.kernel[3 - axes..].iter().map(|k| 2 * k - 1));
            if bias.shape != expected {
                return Err(invalid_argument!(
                    "rpb shape {:?} does not match expected {:?}",
                    bias.shape,
                    expected
                ));
            }
            Some(bias_layout(bias, axes))
        }
        None => None,
    };

    let scratch = problem
        .batch
        .checked_mul(problem.heads)
        .and_then(|n| n.checked_mul(problem.positions()))
        .and_then(|n| n.checked_mul(problem.slots().max(problem.dim)))
        .filter(|&n| n <= i32::MAX as usize)
        .ok_or_else(|| invalid_argument!("problem is too large for 32-bit indexing"))?;
    tracing::trace!(scratch_elements = scratch, "validated {} request", hyper.rank);

    let operands = Operands {
        query: tensor_layout(query, axes),
        key: tensor_layout(key, axes),
        value: tensor_layout(value, axes),
        rpb,
    };
    Ok((problem, operands))
}

fn check_operand<B>(
    name: &str,
    tensor: &TensorRef<'_, B>,
    rank: usize,
    capacity: usize,
) -> NattenResult<()> {
    if tensor.shape.len() != rank {
        return Err(invalid_argument!(
            "{} must have rank {}, got shape {:?}",
            name,
            rank,
            tensor.shape
        ));
    }
    if tensor.strides.len() != rank {
        return Err(invalid_argument!(
            "{} has {} strides for rank {}",
            name,
            tensor.strides.len(),
            rank
        ));
    }
    if tensor.shape.iter().any(|&e| e == 0) {
        return Err(invalid_argument!(
            "{} extents must be >= 1, got {:?}",
            name,
            tensor.shape
        ));
    }
    if let Some(&s) = tensor
        .strides
        .iter()
        .find(|&&s| s < 0 || s > i32::MAX as isize)
    {
        return Err(invalid_argument!("{} stride {} is out of range", name, s));
    }

    let last = tensor
        .shape
        .iter()
        .zip(&tensor.strides)
        .try_fold(tensor.offset, |acc, (&e, &s)| {
            (e - 1)
                .checked_mul(s as usize)
                .and_then(|step| acc.checked_add(step))
        })
        .ok_or_else(|| invalid_argument!("{} strided span overflows", name))?;

    if last >= capacity {
        return Err(invalid_argument!(
            "{} reaches element {} but its buffer holds {}",
            name,
            last,
            capacity
        ));
    }
    if last > i32::MAX as usize {
        return Err(invalid_argument!("{} is too large for 32-bit indexing", name));
    }
    Ok(())
}

fn tensor_layout<B>(tensor: &TensorRef<'_, B>, axes: usize) -> Layout {
    let s = &tensor.strides;
    let mut spatial = [0i64; 3];
    for (slot, &stride) in spatial[3 - axes..].iter_mut().zip(&s[2..2 + axes]) {
        *slot = stride as i64;
    }
    Layout {
        batch: s[0] as i64,
        head: s[1] as i64,
        spatial,
        inner: s[axes + 2] as i64,
        offset: tensor.offset,
    }
}

fn bias_layout<B>(tensor: &TensorRef<'_, B>, axes: usize) -> Layout {
    let s = &tensor.strides;
    let mut spatial = [0i64; 3];
    for (slot, &stride) in spatial[3 - axes..].iter_mut().zip(&s[1..]) {
        *slot = stride as i64;
    }
    Layout {
        batch: 0,
        head: s[0] as i64,
        spatial,
        inner: 0,
        offset: tensor.offset,
    }
}
