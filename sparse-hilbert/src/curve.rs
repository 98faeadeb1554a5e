//! N-dimensional Hilbert curve mapping and query-box decomposition.
//!
//! The Hilbert curve is a continuous fractal space-filling curve that maps an
//! N-dimensional ordinate tuple to a single integer while preserving spatial
//! locality: tuples that are close in space tend to have close curve indexes.
//! That locality is what lets a one-dimensional sorted file answer
//! multi-dimensional range queries with a handful of contiguous reads.
//!
//! The point/index transforms use Skilling's algorithm ("Programming the
//! Hilbert curve", AIP Conf. Proc. 707): ordinates are converted to the
//! transposed Hilbert form in place, then the transposed bits are interleaved
//! most-significant level first, dimension 0 first. The box decomposition
//! walks the curve's implicit 2^n-ary tree: every subtree covers both a
//! contiguous index range and an axis-aligned block of cells, so ranges fall
//! out in ascending order without ever enumerating individual cells.

use crate::errors::{IndexError, IndexResult};

/// The curve index must stay within a 31-bit non-negative integer so that it
/// can be stored as a 4-byte key in the on-disk position table.
pub const MAX_INDEX_BITS: u32 = 31;

/// An inclusive range `[low, high]` of curve indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRange {
    low: u64,
    high: u64,
}

impl IndexRange {
    pub fn new(low: u64, high: u64) -> IndexRange {
        debug_assert!(low <= high);
        IndexRange { low, high }
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }
}

/// A Hilbert curve over `dimensions` axes with `bits` of precision per axis.
///
/// `bits * dimensions` is capped at 31 so every curve index fits the signed
/// 32-bit key space used by the on-disk index format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HilbertCurve {
    bits: u32,
    dimensions: u32,
}

impl HilbertCurve {
    pub fn new(bits: u32, dimensions: u32) -> IndexResult<HilbertCurve> {
        if bits == 0 || dimensions == 0 {
            return Err(IndexError::Config(
                "bits and dimensions must both be at least 1".to_string(),
            ));
        }
        if bits
            .checked_mul(dimensions)
            .map_or(true, |total| total > MAX_INDEX_BITS)
        {
            return Err(IndexError::Config(format!(
                "bits * dimensions must be at most {MAX_INDEX_BITS}, got {bits} * {dimensions}"
            )));
        }
        Ok(HilbertCurve { bits, dimensions })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn dimensions(&self) -> u32 {
        self.dimensions
    }

    /// Largest ordinate value on any axis: `2^bits - 1`.
    pub fn max_ordinate(&self) -> u32 {
        (1u32 << self.bits) - 1
    }

    /// Largest curve index: `2^(bits * dimensions) - 1`.
    pub fn max_index(&self) -> u64 {
        (1u64 << (self.bits * self.dimensions)) - 1
    }

    /// Maps an ordinate tuple to its curve index.
    ///
    /// Each ordinate must be in `[0, max_ordinate()]` and the tuple length
    /// must equal the curve's dimension count.
    pub fn index(&self, point: &[u32]) -> u64 {
        debug_assert_eq!(point.len(), self.dimensions as usize);
        let mut x = point.to_vec();
        self.axes_to_transpose(&mut x);
        self.interleave(&x)
    }

    /// Maps a curve index back to its ordinate tuple.
    pub fn point(&self, index: u64) -> Vec<u32> {
        let mut x = self.deinterleave(index);
        self.transpose_to_axes(&mut x);
        x
    }

    /// Decomposes the axis-aligned ordinate box `[low, high]` (inclusive on
    /// both corners) into ascending, non-overlapping index ranges that cover
    /// exactly the cells of the box.
    ///
    /// `max_ranges == 0` means unlimited. A positive bound repeatedly joins
    /// the two ranges separated by the smallest index gap, producing a
    /// coarser covering that reads more bytes but never loses cells.
    pub fn query(&self, low: &[u32], high: &[u32], max_ranges: usize) -> Vec<IndexRange> {
        debug_assert_eq!(low.len(), self.dimensions as usize);
        debug_assert_eq!(high.len(), self.dimensions as usize);
        let mut out = Vec::new();
        self.visit(0, 0, low, high, &mut out);
        if max_ranges > 0 {
            while out.len() > max_ranges {
                let mut best = 0;
                let mut best_gap = u64::MAX;
                for i in 0..out.len() - 1 {
                    let gap = out[i + 1].low - out[i].high;
                    if gap < best_gap {
                        best_gap = gap;
                        best = i;
                    }
                }
                out[best].high = out[best + 1].high;
                out.remove(best + 1);
            }
        }
        out
    }

    /// Visits the curve subtree whose indexes start at `start`, emitting its
    /// whole index range when its block lies inside the box and recursing
    /// when the block merely straddles it.
    fn visit(&self, start: u64, depth: u32, low: &[u32], high: &[u32], out: &mut Vec<IndexRange>) {
        let n = self.dimensions as usize;
        let side = 1u32 << (self.bits - depth);
        let size = 1u64 << ((self.bits - depth) * self.dimensions);
        // The subtree covers an axis-aligned block of `side` cells per axis;
        // any point of the subtree locates it.
        let p = self.point(start);
        let mut contained = true;
        for i in 0..n {
            let block_low = p[i] & !(side - 1);
            let block_high = block_low + (side - 1);
            if block_high < low[i] || block_low > high[i] {
                return; // disjoint
            }
            if block_low < low[i] || block_high > high[i] {
                contained = false;
            }
        }
        if contained {
            push_coalescing(out, start, start + (size - 1));
            return;
        }
        if depth == self.bits {
            return;
        }
        let child_size = size >> self.dimensions;
        for c in 0..(1u64 << self.dimensions) {
            self.visit(start + c * child_size, depth + 1, low, high, out);
        }
    }

    /// Inverse Skilling transform: ordinates to transposed Hilbert form.
    fn axes_to_transpose(&self, x: &mut [u32]) {
        let n = x.len();
        let m = 1u32 << (self.bits - 1);
        // inverse undo excess work
        let mut q = m;
        while q > 1 {
            let p = q - 1;
            for i in 0..n {
                if x[i] & q != 0 {
                    x[0] ^= p;
                } else {
                    let t = (x[0] ^ x[i]) & p;
                    x[0] ^= t;
                    x[i] ^= t;
                }
            }
            q >>= 1;
        }
        // gray encode
        for i in 1..n {
            x[i] ^= x[i - 1];
        }
        let mut t = 0;
        q = m;
        while q > 1 {
            if x[n - 1] & q != 0 {
                t ^= q - 1;
            }
            q >>= 1;
        }
        for v in x.iter_mut() {
            *v ^= t;
        }
    }

    /// Skilling transform: transposed Hilbert form to ordinates.
    fn transpose_to_axes(&self, x: &mut [u32]) {
        let n = x.len();
        let m = 2u32 << (self.bits - 1);
        // gray decode by H ^ (H/2)
        let mut t = x[n - 1] >> 1;
        for i in (1..n).rev() {
            x[i] ^= x[i - 1];
        }
        x[0] ^= t;
        // undo excess work
        let mut q = 2;
        while q != m {
            let p = q - 1;
            for i in (0..n).rev() {
                if x[i] & q != 0 {
                    x[0] ^= p;
                } else {
                    t = (x[0] ^ x[i]) & p;
                    x[0] ^= t;
                    x[i] ^= t;
                }
            }
            q <<= 1;
        }
    }

    /// Interleaves transposed bits into a single index, most-significant
    /// level first, dimension 0 first within each level.
    fn interleave(&self, x: &[u32]) -> u64 {
        let mut index = 0u64;
        for b in (0..self.bits).rev() {
            for v in x {
                index = (index << 1) | ((v >> b) & 1) as u64;
            }
        }
        index
    }

    fn deinterleave(&self, index: u64) -> Vec<u32> {
        let n = self.dimensions as usize;
        let mut x = vec![0u32; n];
        let mut pos = self.bits * self.dimensions;
        for b in (0..self.bits).rev() {
            for v in x.iter_mut() {
                pos -= 1;
                *v |= (((index >> pos) & 1) as u32) << b;
            }
        }
        x
    }
}

fn push_coalescing(out: &mut Vec<IndexRange>, low: u64, high: u64) {
    if let Some(last) = out.last_mut() {
        if last.high + 1 == low {
            last.high = high;
            return;
        }
    }
    out.push(IndexRange::new(low, high));
}
