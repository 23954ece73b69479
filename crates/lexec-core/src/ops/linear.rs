use derive_new::new;

use crate::{
    cpu::{self, MatmulDims},
    infer_bwd_binding, infer_bwd_signature, input_tensor,
    op::check_arity,
    output_tensor, profile, profile_accumulating, profiling_settings, rvec, shape, weight_tensor,
    BindingError, OpShapeInference, OpTaskBinding, OpTaskInvocations, OpTaskSignature, OpTaskType,
    Operator, Permissions, ProfilingSettings, RVec, ShapeError, SlotId, TaskArgumentAccessor,
    TaskError, TaskId, TaskImplFunction, TaskInvocation, TaskSignatureAndImpl, TensorShape,
};

const INPUT: SlotId = SlotId::new(0);
const KERNEL: SlotId = SlotId::new(1);
const OUTPUT: SlotId = SlotId::new(2);
const PROFILING: SlotId = SlotId::new(3);

/// Projects the last input dimension through a `[in_channels, out_channels]`
/// kernel weight. Leading dimensions are batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct LinearAttrs {
    pub out_channels: usize,
}

impl LinearAttrs {
    fn invalid(reason: String) -> ShapeError {
        ShapeError::InvalidAttrs {
            op: "Linear",
            reason,
        }
    }
}

impl OpShapeInference for LinearAttrs {
    fn output_shapes(
        &self,
        inputs: &[TensorShape],
        weights: &[TensorShape],
    ) -> Result<RVec<TensorShape>, ShapeError> {
        check_arity("Linear", inputs, 1)?;
        check_arity("Linear", weights, 1)?;
        let (input, kernel) = (&inputs[0], &weights[0]);
        if input.rank() == 0 {
            return Err(Self::invalid("input must have rank >= 1".to_string()));
        }
        if !input.data_type.is_float() || kernel.data_type != input.data_type {
            return Err(Self::invalid(format!(
                "expected float input and kernel of the same dtype, got {} and {}",
                input.data_type, kernel.data_type
            )));
        }
        let last = input.rank() - 1;
        let expected = shape![input.dims[last], self.out_channels];
        if kernel.dims != expected {
            return Err(Self::invalid(format!(
                "kernel must be {}, got {}",
                expected, kernel.dims
            )));
        }
        Ok(rvec![
            input.with_dims(input.dims.with_dim(last, self.out_channels))
        ])
    }
}

impl OpTaskInvocations for LinearAttrs {
    fn task_ids(&self) -> RVec<TaskId> {
        rvec![TaskId::LinearFwd, TaskId::LinearBwd]
    }

    fn forward(&self) -> Result<TaskInvocation, BindingError> {
        let mut b = OpTaskBinding::default();
        b.bind(INPUT, input_tensor(0))?;
        b.bind(KERNEL, weight_tensor(0))?;
        b.bind(OUTPUT, output_tensor(0))?;
        b.bind_runtime_arg(PROFILING, profiling_settings())?;
        Ok(TaskInvocation::new(TaskId::LinearFwd, b))
    }

    fn backward(&self) -> Result<TaskInvocation, BindingError> {
        let fwd = self.forward()?;
        Ok(TaskInvocation::new(
            TaskId::LinearBwd,
            infer_bwd_binding(&fwd.binding),
        ))
    }
}

impl Operator for LinearAttrs {
    fn name(&self) -> &'static str {
        "Linear"
    }
}

/// `m` rows of `k` input channels projected onto `n` output channels.
fn dims_of(input: &TensorShape, kernel: &TensorShape) -> MatmulDims {
    let batch = input.dims.slice(0..input.rank() - 1).numel();
    MatmulDims::new(batch, kernel.dims[0], kernel.dims[1])
}

fn forward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let input = acc.get_tensor(INPUT, Permissions::RO)?;
    let kernel = acc.get_tensor(KERNEL, Permissions::RO)?;
    let output = acc.get_tensor(OUTPUT, Permissions::WO)?;
    let dims = dims_of(input.shape(), kernel.shape());

    profile(&profiling, "[Linear] forward_time", || {
        cpu::matmul(
            &input.read::<f32>()?,
            &kernel.read::<f32>()?,
            &mut output.write::<f32>()?,
            dims,
            false,
            false,
            false,
        );
        Ok(())
    })
}

fn backward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let input = acc.get_tensor(INPUT, Permissions::RO)?;
    let kernel = acc.get_tensor(KERNEL, Permissions::RO)?;
    let input_grad = acc.get_tensor_grad(INPUT, Permissions::RW)?;
    let kernel_grad = acc.get_tensor_grad(KERNEL, Permissions::RW)?;
    let output_grad = acc.get_tensor_grad(OUTPUT, Permissions::RO)?;
    let MatmulDims { m, k, n } = dims_of(input.shape(), kernel.shape());

    profile_accumulating(
        &profiling,
        "[Linear] backward_time",
        &[&input_grad, &kernel_grad],
        || {
            let output_grad = output_grad.read::<f32>()?;
            // dx[m, k] += dy[m, n] · W^T
            cpu::matmul(
                &output_grad,
                &kernel.read::<f32>()?,
                &mut input_grad.write::<f32>()?,
                MatmulDims::new(m, n, k),
                false,
                true,
                true,
            );
            // dW[k, n] += x^T · dy[m, n]
            cpu::matmul(
                &input.read::<f32>()?,
                &output_grad,
                &mut kernel_grad.write::<f32>()?,
                MatmulDims::new(k, m, n),
                true,
                false,
                true,
            );
            Ok(())
        },
    )
}

fn fwd_signature() -> OpTaskSignature {
    let mut fwd = OpTaskSignature::new(OpTaskType::Fwd);
    fwd.add_input_slot(INPUT);
    fwd.add_weight_slot(KERNEL);
    fwd.add_output_slot(OUTPUT);
    fwd.add_arg_slot::<ProfilingSettings>(PROFILING);
    fwd
}

pub(crate) fn fwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::LinearFwd.into(),
        impl_function: TaskImplFunction::FwdBwd(forward_task_impl),
        task_signature: fwd_signature(),
    }
}

pub(crate) fn bwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::LinearBwd.into(),
        impl_function: TaskImplFunction::FwdBwd(backward_task_impl),
        task_signature: infer_bwd_signature(&fwd_signature()),
    }
}
