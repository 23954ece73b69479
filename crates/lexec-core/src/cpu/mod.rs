mod gemm;
mod reduce;
mod unary;
mod utils;

pub(crate) use gemm::{matmul, MatmulDims};
pub(crate) use reduce::ReduceIndexer;
pub(crate) use unary::{unary_backward, unary_forward};
pub(crate) use utils::{accumulate, AxisPartition};
