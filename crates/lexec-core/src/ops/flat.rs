use crate::{
    cpu, infer_bwd_binding, infer_bwd_signature, input_tensor, op::check_arity, output_tensor,
    profile, profile_accumulating, profiling_settings, rvec, shape, BindingError, OpShapeInference,
    OpTaskBinding, OpTaskInvocations, OpTaskSignature, OpTaskType, Operator, Permissions,
    ProfilingSettings, RVec, ShapeError, SlotId, TaskArgumentAccessor, TaskError, TaskId,
    TaskImplFunction, TaskInvocation, TaskSignatureAndImpl, TensorShape,
};

const INPUT: SlotId = SlotId::new(0);
const OUTPUT: SlotId = SlotId::new(1);
const PROFILING: SlotId = SlotId::new(2);

/// Collapse every dimension after the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlatAttrs;

impl OpShapeInference for FlatAttrs {
    fn output_shapes(
        &self,
        inputs: &[TensorShape],
        weights: &[TensorShape],
    ) -> Result<RVec<TensorShape>, ShapeError> {
        check_arity("Flat", inputs, 1)?;
        check_arity("Flat", weights, 0)?;
        let input = &inputs[0];
        if input.rank() < 2 {
            return Err(ShapeError::InvalidAttrs {
                op: "Flat",
                reason: format!("input must have rank >= 2, got {:?}", input),
            });
        }
        let rest = input.dims.slice(1..input.rank()).numel();
        Ok(rvec![input.with_dims(shape![input.dims[0], rest])])
    }
}

impl OpTaskInvocations for FlatAttrs {
    fn task_ids(&self) -> RVec<TaskId> {
        rvec![TaskId::FlatFwd, TaskId::FlatBwd]
    }

    fn forward(&self) -> Result<TaskInvocation, BindingError> {
        let mut b = OpTaskBinding::default();
        b.bind_runtime_arg(PROFILING, profiling_settings())?;
        b.bind(INPUT, input_tensor(0))?;
        b.bind(OUTPUT, output_tensor(0))?;
        Ok(TaskInvocation::new(TaskId::FlatFwd, b))
    }

    fn backward(&self) -> Result<TaskInvocation, BindingError> {
        let fwd = self.forward()?;
        Ok(TaskInvocation::new(
            TaskId::FlatBwd,
            infer_bwd_binding(&fwd.binding),
        ))
    }
}

impl Operator for FlatAttrs {
    fn name(&self) -> &'static str {
        "Flat"
    }
}

fn forward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let input = acc.get_tensor(INPUT, Permissions::RO)?;
    let output = acc.get_tensor(OUTPUT, Permissions::WO)?;

    profile(&profiling, "[Flat] forward_time", || {
        output
            .write::<f32>()?
            .copy_from_slice(&input.read::<f32>()?);
        Ok(())
    })
}

fn backward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let input_grad = acc.get_tensor_grad(INPUT, Permissions::RW)?;
    let output_grad = acc.get_tensor_grad(OUTPUT, Permissions::RO)?;

    profile_accumulating(&profiling, "[Flat] backward_time", &[&input_grad], || {
        cpu::accumulate(&output_grad.read::<f32>()?, &mut input_grad.write::<f32>()?);
        Ok(())
    })
}

fn fwd_signature() -> OpTaskSignature {
    let mut fwd = OpTaskSignature::new(OpTaskType::Fwd);
    fwd.add_arg_slot::<ProfilingSettings>(PROFILING);
    fwd.add_input_slot(INPUT);
    fwd.add_output_slot(OUTPUT);
    fwd
}

pub(crate) fn fwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::FlatFwd.into(),
        impl_function: TaskImplFunction::FwdBwd(forward_task_impl),
        task_signature: fwd_signature(),
    }
}

pub(crate) fn bwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::FlatBwd.into(),
        impl_function: TaskImplFunction::FwdBwd(backward_task_impl),
        task_signature: infer_bwd_signature(&fwd_signature()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::tests::assert_invocations_valid;

    #[test]
    fn invocations_match_signatures() {
        assert_invocations_valid(&FlatAttrs);
    }

    #[test]
    fn collapses_trailing_dims() {
        let input = TensorShape::f32(shape![2, 3, 4]);
        assert_eq!(
            FlatAttrs.output_shapes(&[input], &[]),
            Ok(rvec![TensorShape::f32(shape![2, 12])])
        );
        assert!(FlatAttrs
            .output_shapes(&[TensorShape::f32(shape![5])], &[])
            .is_err());
    }
}
