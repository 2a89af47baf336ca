//! Attention window derivation
//!
//! Pure per-axis arithmetic shared by the compute programs and the tests.
//! For a query coordinate `q` on an axis of (original) length `L`, with
//! kernel size `K` and dilation `D`:
//!
//! - non-causal: `start = max(0, min(q - (K/2)*D, L - (K-1)*D - 1))`, and the
//!   window always holds `K` in-range coordinates;
//! - causal: the last slot is `min(q, L-1)` and the window runs backward from
//!   it; coordinates below zero are invalid slots.
//!
//! Slot `j` sits at `start + j*D`. Callers guarantee `L >= (K-1)*D + 1`.

/// Start coordinate of the window; negative only for causal windows near 0.
pub fn window_start(
    query: usize,
    length: usize,
    kernel_size: usize,
    dilation: usize,
    is_causal: bool,
) -> i64 {
    let q = query as i64;
    let l = length as i64;
    let span = (kernel_size as i64 - 1) * dilation as i64;

    if is_causal {
        q.min(l - 1) - span
    } else {
        let centered = q - (kernel_size as i64 / 2) * dilation as i64;
        centered.min(l - span - 1).max(0)
    }
}

/// RPB table index for a query/key pair on one axis, in `[0, 2K-2]`.
///
/// `(K-1) + floor((key - query) / D)`; rows outside the original extent
/// (padding) clamp to the table edge.
pub fn rpb_index(query: usize, key: usize, kernel_size: usize, dilation: usize) -> usize {
    let offset = (key as i64 - query as i64).div_euclid(dilation as i64);
    let max_index = 2 * (kernel_size as i64 - 1);
    (kernel_size as i64 - 1 + offset).clamp(0, max_index) as usize
}

/// The ordered window of one query on one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisWindow {
    start: i64,
    kernel_size: usize,
    dilation: usize,
    length: usize,
}

impl AxisWindow {
    pub fn derive(
        query: usize,
        length: usize,
        kernel_size: usize,
        dilation: usize,
        is_causal: bool,
    ) -> Self {
        AxisWindow {
            start: window_start(query, length, kernel_size, dilation, is_causal),
            kernel_size,
            dilation,
            length,
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Coordinate of slot `slot`; may be negative or past the end.
    pub fn coord(&self, slot: usize) -> i64 {
        self.start + (slot * self.dilation) as i64
    }

    pub fn is_valid(&self, slot: usize) -> bool {
        let c = self.coord(slot);
        slot < self.kernel_size && c >= 0 && c < self.length as i64
    }

    /// Coordinate of a valid slot
    pub fn position(&self, slot: usize) -> Option<usize> {
        self.is_valid(slot).then(|| self.coord(slot) as usize)
    }

    /// All slot coordinates in order, invalid ones included
    pub fn coords(&self) -> impl Iterator<Item = i64> + '_ {
        (0..self.kernel_size).map(move |slot| self.coord(slot))
    }

    pub fn valid_positions(&self) -> Vec<usize> {
        (0..self.kernel_size)
            .filter_map(|slot| self.position(slot))
            .collect()
    }
}
