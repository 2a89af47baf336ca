//! Neighborhood attention
//!
//! Each query position attends to a fixed-size, dilation-spaced window of
//! key/value positions around it, over 1, 2 or 3 spatial axes, with optional
//! causal masking and an optional relative-position bias (RPB).
//!
//! Tensor layouts:
//!
//! | rank | query / key / value | rpb | output |
//! |---|---|---|---|
//! | 1D | `[B, H, L, D]` | `[H, 2K-1]` | `[B, L, H*D]` |
//! | 2D | `[B, H, Y, X, D]` | `[H, 2K-1, 2K-1]` | `[B, Y, X, H*D]` |
//! | 3D | `[B, H, Z, Y, X, D]` | `[H, 2Kd-1, 2K-1, 2K-1]` | `[B, Z, Y, X, H*D]` |
//!
//! `Z`, `Y`, `X` are depth, height and width.
//!
//! Inputs may carry arbitrary non-negative element strides. The output is
//! always dense.

pub mod descriptors;
mod dispatch;
mod problem;
pub mod window;

pub use dispatch::{fmha_forward, na1d_forward, na2d_forward, na3d_forward};
pub use window::{rpb_index, window_start, AxisWindow};

/// Row-major strides for `shape`
pub fn contiguous_strides(shape: &[usize]) -> Vec<isize> {
    let mut strides = vec![1isize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1] as isize;
    }
    strides
}

/// A device buffer viewed as a strided tensor
#[derive(Debug)]
pub struct TensorRef<'a, B> {
    pub buffer: &'a B,
    pub shape: Vec<usize>,
    /// Element strides, one per axis
    pub strides: Vec<isize>,
    /// Element offset of the first element
    pub offset: usize,
}

impl<'a, B> TensorRef<'a, B> {
    pub fn contiguous(buffer: &'a B, shape: Vec<usize>) -> Self {
        let strides = contiguous_strides(&shape);
        TensorRef {
            buffer,
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn strided(buffer: &'a B, shape: Vec<usize>, strides: Vec<isize>) -> Self {
        TensorRef {
            buffer,
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

impl<B> Clone for TensorRef<'_, B> {
    fn clone(&self) -> Self {
        TensorRef {
            buffer: self.buffer,
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            offset: self.offset,
        }
    }
}

/// Hyperparameters of a 1D request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Na1dParams {
    pub kernel_size: usize,
    pub dilation: usize,
    pub is_causal: bool,
    /// Unpadded length; `None` means the full tensor length
    pub original_length: Option<usize>,
}

impl Na1dParams {
    pub fn new(kernel_size: usize) -> Self {
        Na1dParams {
            kernel_size,
            dilation: 1,
            is_causal: false,
            original_length: None,
        }
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_causal(mut self, is_causal: bool) -> Self {
        self.is_causal = is_causal;
        self
    }

    pub fn with_original_length(mut self, length: usize) -> Self {
        self.original_length = Some(length);
        self
    }
}

/// Hyperparameters of a 2D request; kernel and dilation apply to both axes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Na2dParams {
    pub kernel_size: usize,
    pub dilation: usize,
    pub is_causal: bool,
    pub original_height: Option<usize>,
    pub original_width: Option<usize>,
}

impl Na2dParams {
    pub fn new(kernel_size: usize) -> Self {
        Na2dParams {
            kernel_size,
            dilation: 1,
            is_causal: false,
            original_height: None,
            original_width: None,
        }
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_causal(mut self, is_causal: bool) -> Self {
        self.is_causal = is_causal;
        self
    }

    pub fn with_original_size(mut self, height: usize, width: usize) -> Self {
        self.original_height = Some(height);
        self.original_width = Some(width);
        self
    }
}

/// Hyperparameters of a 3D request
///
/// The depth axis has its own kernel size and dilation; height and width
/// share `kernel_size` and `dilation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Na3dParams {
    pub kernel_size_d: usize,
    pub kernel_size: usize,
    pub dilation_d: usize,
    pub dilation: usize,
    pub is_causal: bool,
    pub original_depth: Option<usize>,
    pub original_height: Option<usize>,
    pub original_width: Option<usize>,
}

impl Na3dParams {
    pub fn new(kernel_size_d: usize, kernel_size: usize) -> Self {
        Na3dParams {
            kernel_size_d,
            kernel_size,
            dilation_d: 1,
            dilation: 1,
            is_causal: false,
            original_depth: None,
            original_height: None,
            original_width: None,
        }
    }

    pub fn with_dilation_d(mut self, dilation_d: usize) -> Self {
        self.dilation_d = dilation_d;
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_causal(mut self, is_causal: bool) -> Self {
        self.is_causal = is_causal;
        self
    }

    pub fn with_original_size(mut self, depth: usize, height: usize, width: usize) -> Self {
        self.original_depth = Some(depth);
        self.original_height = Some(height);
        self.original_width = Some(width);
        self
    }
}

/// Result of a forward call; the caller owns the buffer
#[derive(Debug)]
pub struct AttentionOutput<B> {
    pub buffer: B,
    pub shape: Vec<usize>,
    pub strides: Vec<isize>,
}

impl<B> AttentionOutput<B> {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn as_tensor_ref(&self) -> TensorRef<'_, B> {
        TensorRef::strided(&self.buffer, self.shape.clone(), self.strides.clone())
    }

    pub fn into_buffer(self) -> B {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(contiguous_strides(&[2, 3, 8, 4]), vec![96, 32, 4, 1]);
        assert_eq!(contiguous_strides(&[5]), vec![1]);
        assert!(contiguous_strides(&[]).is_empty());
    }

    #[test]
    fn test_params_builders() {
        let p = Na1dParams::new(5)
            .with_dilation(2)
            .with_causal(true)
            .with_original_length(30);
        assert_eq!(p.kernel_size, 5);
        assert_eq!(p.dilation, 2);
        assert!(p.is_causal);
        assert_eq!(p.original_length, Some(30));

        let p = Na3dParams::new(3, 5).with_dilation_d(2).with_original_size(6, 7, 8);
        assert_eq!(p.kernel_size_d, 3);
        assert_eq!(p.dilation_d, 2);
        assert_eq!(p.dilation, 1);
        assert_eq!(p.original_width, Some(8));
    }

    #[test]
    fn test_tensor_ref_offset() {
        let buffer = ();
        let t = TensorRef::contiguous(&buffer, vec![2, 4]).with_offset(3);
        assert_eq!(t.offset, 3);
        assert_eq!(t.rank(), 2);
        assert_eq!(t.numel(), 8);
        assert_eq!(t.strides, vec![4, 1]);
    }
}
