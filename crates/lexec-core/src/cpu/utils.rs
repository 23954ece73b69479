use std::ops::Range;

use num_traits::Float;

use crate::{rvec, RVec, Shape};

/// `dst += src`, elementwise.
pub(crate) fn accumulate<T: Float>(src: &[T], dst: &mut [T]) {
    for (s, d) in src.iter().zip(dst.iter_mut()) {
        *d = *d + *s;
    }
}

/// Cuts a row-major tensor along one axis into consecutive pieces.
///
/// Every piece has the whole tensor's shape except along the axis, where it
/// has its own size. A piece is stored contiguously in its own buffer.
#[derive(Debug, Clone)]
pub(crate) struct AxisPartition {
    outer: usize,
    inner: usize,
    total: usize,
    offsets: RVec<usize>,
    sizes: RVec<usize>,
}

impl AxisPartition {
    pub fn new(dims: &Shape, axis: usize, sizes: RVec<usize>) -> Self {
        let offsets = sizes
            .iter()
            .scan(0, |acc, s| {
                let offset = *acc;
                *acc += s;
                Some(offset)
            })
            .collect();
        Self {
            outer: dims.outer_size(axis),
            inner: dims.stride_of(axis),
            total: sizes.iter().sum(),
            offsets,
            sizes,
        }
    }

    /// `degree` pieces of equal size along `axis` of `dims`.
    pub fn even(dims: &Shape, axis: usize, degree: usize) -> Self {
        Self::new(dims, axis, rvec![dims[axis] / degree; degree])
    }

    pub fn num_parts(&self) -> usize {
        self.sizes.len()
    }

    /// Pairs of (range in the whole tensor, range in the piece).
    fn blocks(&self, part: usize) -> impl Iterator<Item = (Range<usize>, Range<usize>)> + '_ {
        let len = self.sizes[part] * self.inner;
        let offset = self.offsets[part];
        (0..self.outer).map(move |o| {
            let start = (o * self.total + offset) * self.inner;
            (start..start + len, o * len..(o + 1) * len)
        })
    }

    pub fn gather<T: Copy>(&self, whole: &[T], part: usize, piece: &mut [T]) {
        for (w, p) in self.blocks(part) {
            piece[p].copy_from_slice(&whole[w]);
        }
    }

    pub fn gather_add<T: Float>(&self, whole: &[T], part: usize, piece: &mut [T]) {
        for (w, p) in self.blocks(part) {
            accumulate(&whole[w], &mut piece[p]);
        }
    }

    pub fn scatter<T: Copy>(&self, piece: &[T], part: usize, whole: &mut [T]) {
        for (w, p) in self.blocks(part) {
            whole[w].copy_from_slice(&piece[p]);
        }
    }

    pub fn scatter_add<T: Float>(&self, piece: &[T], part: usize, whole: &mut [T]) {
        for (w, p) in self.blocks(part) {
            accumulate(&piece[p], &mut whole[w]);
        }
    }
}
