use crate::{shape, DType, RVec};
use std::ops::RangeTo;

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(RVec<usize>);

impl Shape {
    pub fn new(shape: RVec<usize>) -> Self {
        Self(shape)
    }

    pub fn inner(&self) -> &RVec<usize> {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&usize> {
        self.0.get(index)
    }

    pub fn insert(&mut self, index: usize, dim: usize) {
        self.0.insert(index, dim);
    }

    pub fn remove(&mut self, index: usize) -> usize {
        self.0.remove(index)
    }

    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.0.to_vec()
    }

    pub fn iter(&self) -> impl Iterator<Item = &usize> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rank(&self) -> usize {
        self.len()
    }

    pub fn push(&mut self, dim: usize) {
        self.0.push(dim);
    }

    pub fn slice(&self, range: std::ops::Range<usize>) -> Self {
        Shape(self.0[range].to_vec().into())
    }

    /// Number of contiguous elements spanned by one step along `dim`.
    pub fn stride_of(&self, dim: usize) -> usize {
        self.0.iter().skip(dim + 1).product()
    }

    /// Product of all dimensions before `dim`.
    pub fn outer_size(&self, dim: usize) -> usize {
        self.0.iter().take(dim).product()
    }

    /// Row-major strides, outermost first.
    pub fn strides(&self) -> RVec<usize> {
        (0..self.rank()).map(|d| self.stride_of(d)).collect()
    }

    pub fn with_dim(&self, dim: usize, size: usize) -> Self {
        let mut shape = self.clone();
        shape[dim] = size;
        shape
    }
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut shape = format!("[{}", self.0.first().unwrap_or(&0));
        for dim in self.0.iter().skip(1) {
            shape.push_str(&format!("x{}", dim));
        }
        write!(f, "{}]", shape)
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = usize;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl std::ops::IndexMut<usize> for Shape {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0[index]
    }
}

impl std::ops::Index<RangeTo<usize>> for Shape {
    type Output = [usize];

    fn index(&self, index: RangeTo<usize>) -> &Self::Output {
        &self.0[index]
    }
}

impl From<Vec<usize>> for Shape {
    fn from(shape: Vec<usize>) -> Self {
        Self(shape.into())
    }
}

impl From<&[usize]> for Shape {
    fn from(slice: &[usize]) -> Self {
        Shape(slice.into())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape(dims.iter().copied().collect())
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("{op} expects {expected} inputs, got {actual}")]
    ArityMismatch {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Dimension {dim} is out of range for rank {rank}")]
    DimOutOfRange { dim: usize, rank: usize },
    #[error("Split sizes sum to {actual}, but the split axis has size {expected}")]
    SplitSizeMismatch { expected: usize, actual: usize },
    #[error("Dimension of size {size} is not divisible by degree {degree}")]
    NotDivisible { size: usize, degree: usize },
    #[error("Invalid attributes for {op}: {reason}")]
    InvalidAttrs { op: &'static str, reason: String },
}

/// Logical shape of a graph tensor: its dimensions plus element type.
#[derive(Clone, PartialEq, Eq, Hash, derive_new::new)]
pub struct TensorShape {
    pub dims: Shape,
    pub data_type: DType,
}

impl TensorShape {
    pub fn f32(dims: impl Into<Shape>) -> Self {
        Self::new(dims.into(), DType::F32)
    }

    pub fn numel(&self) -> usize {
        self.dims.numel()
    }

    pub fn num_bytes(&self) -> usize {
        self.numel() * self.data_type.size_of()
    }

    pub fn rank(&self) -> usize {
        self.dims.rank()
    }

    pub fn with_dims(&self, dims: Shape) -> Self {
        Self::new(dims, self.data_type)
    }
}

impl std::fmt::Debug for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.dims, self.data_type)
    }
}

impl Default for TensorShape {
    fn default() -> Self {
        Self::new(shape![], DType::F32)
    }
}

#[cfg(test)]
mod tests {
    use crate::{shape, Shape};
    use proptest::prelude::*;
    use test_strategy::proptest;

    #[test]
    fn strides_are_row_major() {
        let s = shape![2, 3, 4];
        assert_eq!(s.strides().to_vec(), vec![12, 4, 1]);
        assert_eq!(s.outer_size(1), 2);
        assert_eq!(s.stride_of(0), 12);
    }

    #[test]
    fn debug_format() {
        assert_eq!(format!("{:?}", shape![2, 3]), "[2x3]");
    }

    #[proptest(cases = 64)]
    fn outer_stride_and_dim_cover_numel(
        #[strategy(prop::collection::vec(1..6usize, 1..5))] dims: Vec<usize>,
    ) {
        let shape = Shape::from(dims.clone());
        for d in 0..shape.rank() {
            prop_assert_eq!(shape.outer_size(d) * shape[d] * shape.stride_of(d), shape.numel());
        }
    }
}
