use num_traits::Float;

use crate::{RVec, Shape};

/// Maps each input element to the output element it reduces into.
///
/// The output is indexed as if reduced axes were kept with size 1, which
/// matches the layout with those axes dropped.
#[derive(Debug, Clone)]
pub(crate) struct ReduceIndexer {
    in_strides: RVec<usize>,
    out_strides: RVec<usize>,
    numel: usize,
}

impl ReduceIndexer {
    pub fn new(dims: &Shape, axes: &[usize]) -> Self {
        let mut kept = dims.clone();
        for &axis in axes {
            kept[axis] = 1;
        }
        let mut out_strides = kept.strides();
        for &axis in axes {
            out_strides[axis] = 0;
        }
        Self {
            in_strides: dims.strides(),
            out_strides,
            numel: dims.numel(),
        }
    }

    fn output_index(&self, mut i: usize) -> usize {
        let mut o = 0;
        for (is, os) in self.in_strides.iter().zip(self.out_strides.iter()) {
            o += (i / is) * os;
            i %= is;
        }
        o
    }

    fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.numel).map(|i| (i, self.output_index(i)))
    }

    /// Overwrites `output` with the scaled sum over the reduced axes.
    pub fn forward<T: Float>(&self, input: &[T], scale: T, output: &mut [T]) {
        output.fill(T::zero());
        for (i, o) in self.pairs() {
            output[o] = output[o] + input[i];
        }
        for y in output.iter_mut() {
            *y = *y * scale;
        }
    }

    /// Accumulates the scaled output gradient into every element it came from.
    pub fn backward<T: Float>(&self, output_grad: &[T], scale: T, input_grad: &mut [T]) {
        for (i, o) in self.pairs() {
            input_grad[i] = input_grad[i] + output_grad[o] * scale;
        }
    }
}
