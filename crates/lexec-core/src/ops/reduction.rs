use derive_new::new;

use crate::{
    cpu::AxisPartition, input_tensor, op::{check_arity, check_dim}, output_tensor, profile,
    profile_accumulating, profiling_settings, rvec, BindingError, OpShapeInference, OpTaskBinding,
    OpTaskInvocations, OpTaskSignature, OpTaskType, Operator, Permissions, ProfilingSettings, RVec,
    ShapeError, SlotId, SlotType, TaskArgumentAccessor, TaskError, TaskId, TaskImplFunction,
    TaskInvocation, TaskSignatureAndImpl, TensorShape,
};

const INPUT: SlotId = SlotId::new(0);
const OUTPUT: SlotId = SlotId::new(1);
const ATTRS: SlotId = SlotId::new(2);
const PROFILING: SlotId = SlotId::new(3);

/// Sum `reduction_degree` equal pieces of the input along `reduction_dim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct ReductionAttrs {
    pub reduction_dim: usize,
    pub reduction_degree: usize,
}

impl OpShapeInference for ReductionAttrs {
    fn output_shapes(
        &self,
        inputs: &[TensorShape],
        weights: &[TensorShape],
    ) -> Result<RVec<TensorShape>, ShapeError> {
        check_arity("Reduction", inputs, 1)?;
        check_arity("Reduction", weights, 0)?;
        let input = &inputs[0];
        check_dim(input, self.reduction_dim)?;
        let size = input.dims[self.reduction_dim];
        if self.reduction_degree == 0 || size % self.reduction_degree != 0 {
            return Err(ShapeError::NotDivisible {
                size,
                degree: self.reduction_degree,
            });
        }
        let dims = input
            .dims
            .with_dim(self.reduction_dim, size / self.reduction_degree);
        Ok(rvec![input.with_dims(dims)])
    }
}

impl OpTaskInvocations for ReductionAttrs {
    fn task_ids(&self) -> RVec<TaskId> {
        rvec![TaskId::ReductionFwd, TaskId::ReductionBwd]
    }

    fn forward(&self) -> Result<TaskInvocation, BindingError> {
        let mut b = OpTaskBinding::default();
        b.bind_runtime_arg(PROFILING, profiling_settings())?;
        b.bind_arg(ATTRS, *self)?;
        b.bind(INPUT, input_tensor(0))?;
        b.bind(OUTPUT, output_tensor(0))?;
        Ok(TaskInvocation::new(TaskId::ReductionFwd, b))
    }

    fn backward(&self) -> Result<TaskInvocation, BindingError> {
        let fwd = self.forward()?;
        let mut b = OpTaskBinding::default();
        b.bind_args_from_fwd(&fwd.binding);
        b.bind_grad(INPUT, input_tensor(0))?;
        b.bind_grad(OUTPUT, output_tensor(0))?;
        Ok(TaskInvocation::new(TaskId::ReductionBwd, b))
    }
}

impl Operator for ReductionAttrs {
    fn name(&self) -> &'static str {
        "Reduction"
    }
}

fn forward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let attrs = acc.get_argument::<ReductionAttrs>(ATTRS)?;
    let input = acc.get_tensor(INPUT, Permissions::RO)?;
    let output = acc.get_tensor(OUTPUT, Permissions::WO)?;
    let partition = AxisPartition::even(input.dims(), attrs.reduction_dim, attrs.reduction_degree);

    profile(&profiling, "[Reduction] forward_time", || {
        let input = input.read::<f32>()?;
        let mut output = output.write::<f32>()?;
        output.fill(0.0);
        for part in 0..partition.num_parts() {
            partition.gather_add(&input, part, &mut output);
        }
        Ok(())
    })
}

fn backward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let attrs = acc.get_argument::<ReductionAttrs>(ATTRS)?;
    let input_grad = acc.get_tensor_grad(INPUT, Permissions::RW)?;
    let output_grad = acc.get_tensor_grad(OUTPUT, Permissions::RO)?;
    let partition = AxisPartition::even(
        input_grad.dims(),
        attrs.reduction_dim,
        attrs.reduction_degree,
    );

    profile_accumulating(&profiling, "[Reduction] backward_time", &[&input_grad], || {
        let output_grad = output_grad.read::<f32>()?;
        let mut input_grad = input_grad.write::<f32>()?;
        for part in 0..partition.num_parts() {
            partition.scatter_add(&output_grad, part, &mut input_grad);
        }
        Ok(())
    })
}

fn fwd_signature() -> OpTaskSignature {
    let mut fwd = OpTaskSignature::new(OpTaskType::Fwd);
    fwd.add_arg_slot::<ProfilingSettings>(PROFILING);
    fwd.add_arg_slot::<ReductionAttrs>(ATTRS);
    fwd.add_input_slot(INPUT);
    fwd.add_output_slot(OUTPUT);
    fwd
}

fn bwd_signature() -> OpTaskSignature {
    let mut bwd = OpTaskSignature::new(OpTaskType::Bwd);
    bwd.add_arg_slot::<ProfilingSettings>(PROFILING);
    bwd.add_arg_slot::<ReductionAttrs>(ATTRS);
    bwd.add_input_grad_slot(INPUT, SlotType::Tensor);
    bwd.add_output_grad_slot(OUTPUT, SlotType::Tensor);
    bwd
}

pub(crate) fn fwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::ReductionFwd.into(),
        impl_function: TaskImplFunction::FwdBwd(forward_task_impl),
        task_signature: fwd_signature(),
    }
}

pub(crate) fn bwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::ReductionBwd.into(),
        impl_function: TaskImplFunction::FwdBwd(backward_task_impl),
        task_signature: bwd_signature(),
    }
}
