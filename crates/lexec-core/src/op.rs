use std::fmt::Debug;

use crate::{
    BindingError, CombineAttrs, ElementUnaryAttrs, FlatAttrs, LinearAttrs, ReduceAttrs,
    ReductionAttrs, ReplicateAttrs, RVec, ShapeError, SplitAttrs, TaskId, TaskInvocation,
    TensorShape,
};

/// # OpTaskInvocations
///
/// What an operator kind tells the execution backing about its tasks: which
/// task ids it uses, and how to bind each phase.
///
/// Bindings are rebuilt on every call. Operators without per-device state
/// return `None` from `init`.
pub trait OpTaskInvocations {
    fn task_ids(&self) -> RVec<TaskId>;

    fn init(&self) -> Result<Option<TaskInvocation>, BindingError> {
        Ok(None)
    }

    fn forward(&self) -> Result<TaskInvocation, BindingError>;

    fn backward(&self) -> Result<TaskInvocation, BindingError>;
}

/// # OpShapeInference
///
/// Output shapes of an operator given the shapes of its inputs and weights.
pub trait OpShapeInference {
    fn output_shapes(
        &self,
        inputs: &[TensorShape],
        weights: &[TensorShape],
    ) -> Result<RVec<TensorShape>, ShapeError>;
}

pub trait Operator: OpTaskInvocations + OpShapeInference + Debug {
    fn name(&self) -> &'static str;
}

/// Attributes of a graph node.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputationGraphOpAttrs {
    ElementUnary(ElementUnaryAttrs),
    Split(SplitAttrs),
    Reduce(ReduceAttrs),
    Reduction(ReductionAttrs),
    Replicate(ReplicateAttrs),
    Combine(CombineAttrs),
    Flat(FlatAttrs),
    Linear(LinearAttrs),
}

impl ComputationGraphOpAttrs {
    pub fn operator(&self) -> &dyn Operator {
        match self {
            ComputationGraphOpAttrs::ElementUnary(a) => a,
            ComputationGraphOpAttrs::Split(a) => a,
            ComputationGraphOpAttrs::Reduce(a) => a,
            ComputationGraphOpAttrs::Reduction(a) => a,
            ComputationGraphOpAttrs::Replicate(a) => a,
            ComputationGraphOpAttrs::Combine(a) => a,
            ComputationGraphOpAttrs::Flat(a) => a,
            ComputationGraphOpAttrs::Linear(a) => a,
        }
    }

    pub fn name(&self) -> &'static str {
        self.operator().name()
    }
}

impl OpTaskInvocations for ComputationGraphOpAttrs {
    fn task_ids(&self) -> RVec<TaskId> {
        self.operator().task_ids()
    }

    fn init(&self) -> Result<Option<TaskInvocation>, BindingError> {
        self.operator().init()
    }

    fn forward(&self) -> Result<TaskInvocation, BindingError> {
        self.operator().forward()
    }

    fn backward(&self) -> Result<TaskInvocation, BindingError> {
        self.operator().backward()
    }
}

impl OpShapeInference for ComputationGraphOpAttrs {
    fn output_shapes(
        &self,
        inputs: &[TensorShape],
        weights: &[TensorShape],
    ) -> Result<RVec<TensorShape>, ShapeError> {
        self.operator().output_shapes(inputs, weights)
    }
}

macro_rules! impl_from_attrs {
    ($($variant:ident => $attrs:ty),* $(,)?) => {
        $(
            impl From<$attrs> for ComputationGraphOpAttrs {
                fn from(attrs: $attrs) -> Self {
                    ComputationGraphOpAttrs::$variant(attrs)
                }
            }
        )*
    };
}

impl_from_attrs! {
    ElementUnary => ElementUnaryAttrs,
    Split => SplitAttrs,
    Reduce => ReduceAttrs,
    Reduction => ReductionAttrs,
    Replicate => ReplicateAttrs,
    Combine => CombineAttrs,
    Flat => FlatAttrs,
    Linear => LinearAttrs,
}

/// Fails unless exactly `expected` shapes were provided.
pub(crate) fn check_arity(
    op: &'static str,
    shapes: &[TensorShape],
    expected: usize,
) -> Result<(), ShapeError> {
    if shapes.len() != expected {
        return Err(ShapeError::ArityMismatch {
            op,
            expected,
            actual: shapes.len(),
        });
    }
    Ok(())
}

pub(crate) fn check_dim(shape: &TensorShape, dim: usize) -> Result<(), ShapeError> {
    if dim >= shape.rank() {
        return Err(ShapeError::DimOutOfRange {
            dim,
            rank: shape.rank(),
        });
    }
    Ok(())
}
