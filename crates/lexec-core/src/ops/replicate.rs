use derive_new::new;

use crate::{
    cpu::AxisPartition, infer_bwd_binding, infer_bwd_signature, input_tensor, op::{check_arity,
    check_dim}, output_tensor, profile, profile_accumulating, profiling_settings, rvec,
    BindingError, OpShapeInference, OpTaskBinding, OpTaskInvocations, OpTaskSignature, OpTaskType,
    Operator, Permissions, ProfilingSettings, RVec, ShapeError, SlotId, TaskArgumentAccessor,
    TaskError, TaskId, TaskImplFunction, TaskInvocation, TaskSignatureAndImpl, TensorShape,
};

const INPUT: SlotId = SlotId::new(0);
const OUTPUT: SlotId = SlotId::new(1);
const ATTRS: SlotId = SlotId::new(2);
const PROFILING: SlotId = SlotId::new(3);

/// Tile the input `replicate_degree` times along `replicate_dim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct ReplicateAttrs {
    pub replicate_dim: usize,
    pub replicate_degree: usize,
}

impl OpShapeInference for ReplicateAttrs {
    fn output_shapes(
        &self,
        inputs: &[TensorShape],
        weights: &[TensorShape],
    ) -> Result<RVec<TensorShape>, ShapeError> {
        check_arity("Replicate", inputs, 1)?;
        check_arity("Replicate", weights, 0)?;
        let input = &inputs[0];
        check_dim(input, self.replicate_dim)?;
        if self.replicate_degree == 0 {
            return Err(ShapeError::InvalidAttrs {
                op: "Replicate",
                reason: "replicate_degree must be positive".to_string(),
            });
        }
        let size = input.dims[self.replicate_dim] * self.replicate_degree;
        Ok(rvec![input.with_dims(input.dims.with_dim(self.replicate_dim, size))])
    }
}

impl OpTaskInvocations for ReplicateAttrs {
    fn task_ids(&self) -> RVec<TaskId> {
        rvec![TaskId::ReplicateFwd, TaskId::ReplicateBwd]
    }

    fn forward(&self) -> Result<TaskInvocation, BindingError> {
        let mut b = OpTaskBinding::default();
        b.bind_runtime_arg(PROFILING, profiling_settings())?;
        b.bind_arg(ATTRS, *self)?;
        b.bind(INPUT, input_tensor(0))?;
        b.bind(OUTPUT, output_tensor(0))?;
        Ok(TaskInvocation::new(TaskId::ReplicateFwd, b))
    }

    fn backward(&self) -> Result<TaskInvocation, BindingError> {
        let fwd = self.forward()?;
        Ok(TaskInvocation::new(
            TaskId::ReplicateBwd,
            infer_bwd_binding(&fwd.binding),
        ))
    }
}

impl Operator for ReplicateAttrs {
    fn name(&self) -> &'static str {
        "Replicate"
    }
}

fn forward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let attrs = acc.get_argument::<ReplicateAttrs>(ATTRS)?;
    let input = acc.get_tensor(INPUT, Permissions::RO)?;
    let output = acc.get_tensor(OUTPUT, Permissions::WO)?;
    let partition = AxisPartition::even(
        output.dims(),
        attrs.replicate_dim,
        attrs.replicate_degree,
    );

    profile(&profiling, "[Replicate] forward_time", || {
        let input = input.read::<f32>()?;
        let mut output = output.write::<f32>()?;
        for part in 0..partition.num_parts() {
            partition.scatter(&input, part, &mut output);
        }
        Ok(())
    })
}

fn backward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let attrs = acc.get_argument::<ReplicateAttrs>(ATTRS)?;
    let input_grad = acc.get_tensor_grad(INPUT, Permissions::RW)?;
    let output_grad = acc.get_tensor_grad(OUTPUT, Permissions::RO)?;
    let partition = AxisPartition::even(
        output_grad.dims(),
        attrs.replicate_dim,
        attrs.replicate_degree,
    );

    profile_accumulating(&profiling, "[Replicate] backward_time", &[&input_grad], || {
        let output_grad = output_grad.read::<f32>()?;
        let mut input_grad = input_grad.write::<f32>()?;
        for part in 0..partition.num_parts() {
            partition.gather_add(&output_grad, part, &mut input_grad);
        }
        Ok(())
    })
}

fn fwd_signature() -> OpTaskSignature {
    let mut fwd = OpTaskSignature::new(OpTaskType::Fwd);
    fwd.add_arg_slot::<ProfilingSettings>(PROFILING);
    fwd.add_arg_slot::<ReplicateAttrs>(ATTRS);
    fwd.add_input_slot(INPUT);
    fwd.add_output_slot(OUTPUT);
    fwd
}

pub(crate) fn fwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::ReplicateFwd.into(),
        impl_function: TaskImplFunction::FwdBwd(forward_task_impl),
        task_signature: fwd_signature(),
    }
}

pub(crate) fn bwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::ReplicateBwd.into(),
        impl_function: TaskImplFunction::FwdBwd(backward_task_impl),
        task_signature: infer_bwd_signature(&fwd_signature()),
    }
}
