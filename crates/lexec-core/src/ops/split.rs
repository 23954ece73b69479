use derive_new::new;

use crate::{
    cpu::AxisPartition, input_tensor, op::{check_arity, check_dim}, profile, profile_accumulating,
    profiling_settings, rvec, BindingError, OpShapeInference, OpTaskBinding, OpTaskInvocations,
    OpTaskSignature, OpTaskType, OpTensorSpec, Operator, Permissions, ProfilingSettings, RVec,
    ShapeError, SlotId, SlotType, TaskArgumentAccessor, TaskError, TaskId, TaskImplFunction,
    TaskInvocation, TaskSignatureAndImpl, TensorRole, TensorShape,
};

const INPUT: SlotId = SlotId::new(0);
const OUTPUT: SlotId = SlotId::new(1);
const ATTRS: SlotId = SlotId::new(2);
const PROFILING: SlotId = SlotId::new(3);

/// Partition one tensor into consecutive pieces of `splits` along `axis`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct SplitAttrs {
    pub splits: RVec<usize>,
    pub axis: usize,
}

impl OpShapeInference for SplitAttrs {
    fn output_shapes(
        &self,
        inputs: &[TensorShape],
        weights: &[TensorShape],
    ) -> Result<RVec<TensorShape>, ShapeError> {
        check_arity("Split", inputs, 1)?;
        check_arity("Split", weights, 0)?;
        let input = &inputs[0];
        check_dim(input, self.axis)?;
        let total: usize = self.splits.iter().sum();
        if total != input.dims[self.axis] {
            return Err(ShapeError::SplitSizeMismatch {
                expected: input.dims[self.axis],
                actual: total,
            });
        }
        Ok(self
            .splits
            .iter()
            .map(|s| input.with_dims(input.dims.with_dim(self.axis, *s)))
            .collect())
    }
}

impl OpTaskInvocations for SplitAttrs {
    fn task_ids(&self) -> RVec<TaskId> {
        rvec![TaskId::SplitFwd, TaskId::SplitBwd]
    }

    fn forward(&self) -> Result<TaskInvocation, BindingError> {
        let mut b = OpTaskBinding::default();
        b.bind(INPUT, input_tensor(0))?;
        b.bind(OUTPUT, OpTensorSpec::all(TensorRole::Output))?;
        b.bind_arg(ATTRS, self.clone())?;
        b.bind_runtime_arg(PROFILING, profiling_settings())?;
        Ok(TaskInvocation::new(TaskId::SplitFwd, b))
    }

    /// Only gradients are needed: the input gradient is the concatenation
    /// of the output gradients.
    fn backward(&self) -> Result<TaskInvocation, BindingError> {
        let fwd = self.forward()?;
        let mut b = OpTaskBinding::default();
        b.bind_args_from_fwd(&fwd.binding);
        b.bind_grad(INPUT, input_tensor(0))?;
        b.bind_grad(OUTPUT, OpTensorSpec::all(TensorRole::Output))?;
        Ok(TaskInvocation::new(TaskId::SplitBwd, b))
    }
}

impl Operator for SplitAttrs {
    fn name(&self) -> &'static str {
        "Split"
    }
}

fn forward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let attrs = acc.get_argument::<SplitAttrs>(ATTRS)?;
    let input = acc.get_tensor(INPUT, Permissions::RO)?;
    let outputs = acc.get_variadic_tensor(OUTPUT, Permissions::WO)?;
    let partition = AxisPartition::new(input.dims(), attrs.axis, attrs.splits);

    profile(&profiling, "[Split] forward_time", || {
        let input = input.read::<f32>()?;
        for (part, output) in outputs.iter().enumerate() {
            partition.gather(&input, part, &mut output.write::<f32>()?);
        }
        Ok(())
    })
}

fn backward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let attrs = acc.get_argument::<SplitAttrs>(ATTRS)?;
    let input_grad = acc.get_tensor_grad(INPUT, Permissions::RW)?;
    let output_grads = acc.get_variadic_tensor_grad(OUTPUT, Permissions::RO)?;
    let partition = AxisPartition::new(input_grad.dims(), attrs.axis, attrs.splits);

    profile_accumulating(&profiling, "[Split] backward_time", &[&input_grad], || {
        let mut input_grad = input_grad.write::<f32>()?;
        for (part, output_grad) in output_grads.iter().enumerate() {
            partition.scatter_add(&output_grad.read::<f32>()?, part, &mut input_grad);
        }
        Ok(())
    })
}

fn fwd_signature() -> OpTaskSignature {
    let mut fwd = OpTaskSignature::new(OpTaskType::Fwd);
    fwd.add_input_slot(INPUT);
    fwd.add_output_slot_with(OUTPUT, SlotType::Variadic);
    fwd.add_arg_slot::<SplitAttrs>(ATTRS);
    fwd.add_arg_slot::<ProfilingSettings>(PROFILING);
    fwd
}

fn bwd_signature() -> OpTaskSignature {
    let mut bwd = OpTaskSignature::new(OpTaskType::Bwd);
    bwd.add_input_grad_slot(INPUT, SlotType::Tensor);
    bwd.add_output_grad_slot(OUTPUT, SlotType::Variadic);
    bwd.add_arg_slot::<SplitAttrs>(ATTRS);
    bwd.add_arg_slot::<ProfilingSettings>(PROFILING);
    bwd
}

pub(crate) fn fwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::SplitFwd.into(),
        impl_function: TaskImplFunction::FwdBwd(forward_task_impl),
        task_signature: fwd_signature(),
    }
}

pub(crate) fn bwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::SplitBwd.into(),
        impl_function: TaskImplFunction::FwdBwd(backward_task_impl),
        task_signature: bwd_signature(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ops::tests::assert_invocations_valid, shape, IsGrad};
    use proptest::prelude::*;
    use test_strategy::proptest;

    #[test]
    fn invocations_match_signatures() {
        assert_invocations_valid(&SplitAttrs::new(rvec![1, 2], 0));
    }

    #[test]
    fn backward_binds_only_gradients() {
        let bwd = SplitAttrs::new(rvec![1, 2], 0).backward().unwrap();
        assert!(bwd
            .binding
            .tensor_bindings()
            .keys()
            .all(|(_, is_grad)| *is_grad == IsGrad::Yes));
        assert_eq!(bwd.binding.tensor_bindings().len(), 2);
    }

    #[proptest]
    fn output_shapes_partition_the_axis(
        #[strategy(prop::collection::vec(1..5usize, 1..5))] splits: Vec<usize>,
        #[strategy(0..3usize)] axis: usize,
    ) {
        let mut dims = shape![2, 3, 4];
        dims[axis] = splits.iter().sum();
        let input = TensorShape::f32(dims);
        let attrs = SplitAttrs::new(splits.clone().into(), axis);
        let outputs = attrs.output_shapes(&[input.clone()], &[]).unwrap();
        prop_assert_eq!(outputs.len(), splits.len());
        let numel: usize = outputs.iter().map(|o| o.numel()).sum();
        prop_assert_eq!(numel, input.numel());
        for (o, s) in outputs.iter().zip(splits.iter()) {
            prop_assert_eq!(o.dims[axis], *s);
        }
    }

    #[test]
    fn mismatched_splits_are_rejected() {
        let input = TensorShape::f32(shape![4, 6]);
        assert_eq!(
            SplitAttrs::new(rvec![2, 2], 1).output_shapes(&[input.clone()], &[]),
            Err(ShapeError::SplitSizeMismatch {
                expected: 6,
                actual: 4
            })
        );
        assert!(matches!(
            SplitAttrs::new(rvec![4], 2).output_shapes(&[input], &[]),
            Err(ShapeError::DimOutOfRange { dim: 2, rank: 2 })
        ));
    }
}
