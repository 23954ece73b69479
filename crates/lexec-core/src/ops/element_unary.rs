use derive_new::new;

use crate::{
    cpu, device_handle, infer_bwd_binding, infer_bwd_signature, input_tensor, input_tensor_shape,
    op::check_arity, output_tensor, per_device_op_state, profile, profile_accumulating,
    profiling_settings, rvec, BindingError, ConcreteArg, DeviceSpecific, DeviceStates,
    OpShapeInference, OpTaskBinding, OpTaskInvocations, OpTaskSignature, OpTaskType, Operator,
    PerDeviceHandle, Permissions, ProfilingSettings, RVec, ShapeError, SlotId, TaskArgumentAccessor,
    TaskError, TaskId, TaskImplFunction, TaskInvocation, TaskSignatureAndImpl, TensorShape,
};

#[cfg(test)]
use test_strategy::Arbitrary;

const INPUT: SlotId = SlotId::new(0);
const INPUT_SHAPE: SlotId = SlotId::new(1);
const OUTPUT: SlotId = SlotId::new(2);
const ATTRS: SlotId = SlotId::new(3);
const HANDLE: SlotId = SlotId::new(4);
const PROFILING: SlotId = SlotId::new(5);
const PER_DEVICE_STATE: SlotId = SlotId::new(6);

#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::EnumIter, strum_macros::Display)]
pub enum ElementUnaryOpType {
    Identity,
    Relu,
    Sigmoid,
    Tanh,
    Elu,
    Exp,
    Sin,
    Cos,
    Gelu,
    Rsqrt,
    ScalarMultiply,
    ScalarAdd,
    ScalarSub,
    ScalarTrueDiv,
    Pow,
}

impl ElementUnaryOpType {
    pub fn requires_scalar(&self) -> bool {
        use ElementUnaryOpType::*;
        matches!(
            self,
            ScalarMultiply | ScalarAdd | ScalarSub | ScalarTrueDiv | Pow
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct ElementUnaryAttrs {
    pub op_type: ElementUnaryOpType,
    pub scalar: Option<f32>,
}

impl ElementUnaryAttrs {
    fn scalar(&self) -> Result<f32, ShapeError> {
        match (self.op_type.requires_scalar(), self.scalar) {
            (true, None) => Err(ShapeError::InvalidAttrs {
                op: "ElementUnary",
                reason: format!("{} requires a scalar operand", self.op_type),
            }),
            (_, scalar) => Ok(scalar.unwrap_or_default()),
        }
    }
}

/// Resolved once per device by the init task.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementUnaryPerDeviceState {
    pub op_type: ElementUnaryOpType,
    pub scalar: f32,
    pub input_shape: TensorShape,
    pub output_shape: TensorShape,
}

impl OpShapeInference for ElementUnaryAttrs {
    fn output_shapes(
        &self,
        inputs: &[TensorShape],
        weights: &[TensorShape],
    ) -> Result<RVec<TensorShape>, ShapeError> {
        check_arity("ElementUnary", inputs, 1)?;
        check_arity("ElementUnary", weights, 0)?;
        self.scalar()?;
        Ok(rvec![inputs[0].clone()])
    }
}

impl OpTaskInvocations for ElementUnaryAttrs {
    fn task_ids(&self) -> RVec<TaskId> {
        rvec![
            TaskId::ElementUnaryInit,
            TaskId::ElementUnaryFwd,
            TaskId::ElementUnaryBwd
        ]
    }

    fn init(&self) -> Result<Option<TaskInvocation>, BindingError> {
        let mut b = OpTaskBinding::default();
        b.bind_arg(ATTRS, *self)?;
        b.bind_op_arg(INPUT_SHAPE, input_tensor_shape(0))?;
        b.bind_runtime_arg(HANDLE, device_handle())?;
        Ok(Some(TaskInvocation::new(TaskId::ElementUnaryInit, b)))
    }

    fn forward(&self) -> Result<TaskInvocation, BindingError> {
        let mut b = OpTaskBinding::default();
        b.bind(INPUT, input_tensor(0))?;
        b.bind(OUTPUT, output_tensor(0))?;
        b.bind_arg(ATTRS, *self)?;
        b.bind_runtime_arg(HANDLE, device_handle())?;
        b.bind_runtime_arg(PROFILING, profiling_settings())?;
        b.bind_op_arg(
            PER_DEVICE_STATE,
            per_device_op_state::<ElementUnaryPerDeviceState>(),
        )?;
        Ok(TaskInvocation::new(TaskId::ElementUnaryFwd, b))
    }

    fn backward(&self) -> Result<TaskInvocation, BindingError> {
        let fwd = self.forward()?;
        Ok(TaskInvocation::new(
            TaskId::ElementUnaryBwd,
            infer_bwd_binding(&fwd.binding),
        ))
    }
}

impl Operator for ElementUnaryAttrs {
    fn name(&self) -> &'static str {
        "ElementUnary"
    }
}

fn init_task_impl(acc: &TaskArgumentAccessor) -> Result<DeviceSpecific<DeviceStates>, TaskError> {
    let attrs = acc.get_argument::<ElementUnaryAttrs>(ATTRS)?;
    let input_shape = acc.get_argument::<TensorShape>(INPUT_SHAPE)?;
    let handle = acc.get_argument::<PerDeviceHandle>(HANDLE)?;
    let output_shape = input_shape.clone();
    log::trace!(
        "ElementUnary init: {} {:?}, workspace {}",
        attrs.op_type,
        input_shape,
        handle.workspace_size
    );
    let state = ElementUnaryPerDeviceState {
        op_type: attrs.op_type,
        scalar: attrs.scalar()?,
        input_shape,
        output_shape,
    };
    Ok(DeviceSpecific::create(
        acc.device_idx(),
        ConcreteArg::create(state),
    ))
}

fn forward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let state = acc.get_argument::<ElementUnaryPerDeviceState>(PER_DEVICE_STATE)?;
    let input = acc.get_tensor(INPUT, Permissions::RO)?;
    let output = acc.get_tensor(OUTPUT, Permissions::WO)?;

    profile(&profiling, "[ElementUnary] forward_time", || {
        cpu::unary_forward(
            state.op_type,
            state.scalar,
            &input.read::<f32>()?,
            &mut output.write::<f32>()?,
        );
        Ok(())
    })
}

fn backward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let state = acc.get_argument::<ElementUnaryPerDeviceState>(PER_DEVICE_STATE)?;
    let input = acc.get_tensor(INPUT, Permissions::RO)?;
    let input_grad = acc.get_tensor_grad(INPUT, Permissions::RW)?;
    let output = acc.get_tensor(OUTPUT, Permissions::RO)?;
    let output_grad = acc.get_tensor_grad(OUTPUT, Permissions::RO)?;

    profile_accumulating(&profiling, "[ElementUnary] backward_time", &[&input_grad], || {
        cpu::unary_backward(
            state.op_type,
            state.scalar,
            &input.read::<f32>()?,
            &output.read::<f32>()?,
            &output_grad.read::<f32>()?,
            &mut input_grad.write::<f32>()?,
        );
        Ok(())
    })
}

fn init_signature() -> OpTaskSignature {
    let mut init = OpTaskSignature::new(OpTaskType::Init);
    init.add_arg_slot::<TensorShape>(INPUT_SHAPE);
    init.add_arg_slot::<ElementUnaryAttrs>(ATTRS);
    init.add_unchecked_arg_slot::<PerDeviceHandle>(HANDLE);
    init.add_return_value::<ElementUnaryPerDeviceState>();
    init
}

fn fwd_signature() -> OpTaskSignature {
    let mut fwd = OpTaskSignature::new(OpTaskType::Fwd);
    fwd.add_input_slot(INPUT);
    fwd.add_output_slot(OUTPUT);
    fwd.add_arg_slot::<ElementUnaryAttrs>(ATTRS);
    fwd.add_arg_slot::<ProfilingSettings>(PROFILING);
    fwd.add_unchecked_arg_slot::<PerDeviceHandle>(HANDLE);
    fwd.add_unchecked_arg_slot::<ElementUnaryPerDeviceState>(PER_DEVICE_STATE);
    fwd
}

pub(crate) fn init_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::ElementUnaryInit.into(),
        impl_function: TaskImplFunction::Init(init_task_impl),
        task_signature: init_signature(),
    }
}

pub(crate) fn fwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::ElementUnaryFwd.into(),
        impl_function: TaskImplFunction::FwdBwd(forward_task_impl),
        task_signature: fwd_signature(),
    }
}

pub(crate) fn bwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::ElementUnaryBwd.into(),
        impl_function: TaskImplFunction::FwdBwd(backward_task_impl),
        task_signature: infer_bwd_signature(&fwd_signature()),
    }
}
