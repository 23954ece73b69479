use derive_new::new;

use crate::{
    cpu, infer_bwd_binding, infer_bwd_signature, input_tensor, op::{check_arity, check_dim},
    output_tensor, profile, profile_accumulating, profiling_settings, rvec, BindingError,
    OpShapeInference, OpTaskBinding, OpTaskInvocations, OpTaskSignature, OpTaskType, Operator,
    Permissions, ProfilingSettings, RVec, ShapeError, SlotId, TaskArgumentAccessor, TaskError,
    TaskId, TaskImplFunction, TaskInvocation, TaskSignatureAndImpl, TensorShape,
};

const INPUT: SlotId = SlotId::new(0);
const OUTPUT: SlotId = SlotId::new(1);
const PROFILING: SlotId = SlotId::new(2);

/// Gather `combine_degree` shards along `combine_dim`. On a single device
/// every shard is already local, so data passes through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct CombineAttrs {
    pub combine_dim: usize,
    pub combine_degree: usize,
}

impl OpShapeInference for CombineAttrs {
    fn output_shapes(
        &self,
        inputs: &[TensorShape],
        weights: &[TensorShape],
    ) -> Result<RVec<TensorShape>, ShapeError> {
        check_arity("Combine", inputs, 1)?;
        check_arity("Combine", weights, 0)?;
        let input = &inputs[0];
        check_dim(input, self.combine_dim)?;
        let size = input.dims[self.combine_dim];
        if self.combine_degree == 0 || size % self.combine_degree != 0 {
            return Err(ShapeError::NotDivisible {
                size,
                degree: self.combine_degree,
            });
        }
        Ok(rvec![input.clone()])
    }
}

impl OpTaskInvocations for CombineAttrs {
    fn task_ids(&self) -> RVec<TaskId> {
        rvec![TaskId::CombineFwd, TaskId::CombineBwd]
    }

    fn forward(&self) -> Result<TaskInvocation, BindingError> {
        let mut b = OpTaskBinding::default();
        b.bind_runtime_arg(PROFILING, profiling_settings())?;
        b.bind(INPUT, input_tensor(0))?;
        b.bind(OUTPUT, output_tensor(0))?;
        Ok(TaskInvocation::new(TaskId::CombineFwd, b))
    }

    fn backward(&self) -> Result<TaskInvocation, BindingError> {
        let fwd = self.forward()?;
        Ok(TaskInvocation::new(
            TaskId::CombineBwd,
            infer_bwd_binding(&fwd.binding),
        ))
    }
}

impl Operator for CombineAttrs {
    fn name(&self) -> &'static str {
        "Combine"
    }
}

fn forward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let input = acc.get_tensor(INPUT, Permissions::RO)?;
    let output = acc.get_tensor(OUTPUT, Permissions::WO)?;

    profile(&profiling, "[Combine] forward_time", || {
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

    profile_accumulating(&profiling, "[Combine] backward_time", &[&input_grad], || {
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
        name: TaskId::CombineFwd.into(),
        impl_function: TaskImplFunction::FwdBwd(forward_task_impl),
        task_signature: fwd_signature(),
    }
}

pub(crate) fn bwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::CombineBwd.into(),
        impl_function: TaskImplFunction::FwdBwd(backward_task_impl),
        task_signature: infer_bwd_signature(&fwd_signature()),
    }
}
