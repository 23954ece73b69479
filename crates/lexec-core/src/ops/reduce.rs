use derive_new::new;
use itertools::Itertools;

use crate::{
    cpu::ReduceIndexer, device_handle, infer_bwd_binding, infer_bwd_signature, input_tensor,
    op::{check_arity, check_dim}, output_tensor, per_device_op_state, profile, profile_accumulating,
    profiling_settings, rvec, BindingError, ConcreteArg, DeviceSpecific, DeviceStates,
    OpShapeInference, OpTaskBinding, OpTaskInvocations, OpTaskSignature, OpTaskType, Operator,
    PerDeviceHandle, Permissions, ProfilingSettings, RVec, Shape, ShapeError, SlotId,
    TaskArgumentAccessor, TaskError, TaskId, TaskImplFunction, TaskInvocation, TaskSignatureAndImpl,
    TensorShape,
};

#[cfg(test)]
use test_strategy::Arbitrary;

const INPUT: SlotId = SlotId::new(0);
const OUTPUT: SlotId = SlotId::new(1);
const ATTRS: SlotId = SlotId::new(2);
const PROFILING: SlotId = SlotId::new(3);
const PER_DEVICE_STATE: SlotId = SlotId::new(4);
const HANDLE: SlotId = SlotId::new(5);

#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ReduceOpType {
    Sum,
    Mean,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct ReduceAttrs {
    pub axes: RVec<usize>,
    pub op_type: ReduceOpType,
    pub keep_dims: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReducePerDeviceState {
    pub op_type: ReduceOpType,
    /// Number of input elements folded into each output element.
    pub reduction_size: usize,
    pub input_dims: Shape,
    pub axes: RVec<usize>,
}

impl ReducePerDeviceState {
    fn scale(&self) -> f32 {
        match self.op_type {
            ReduceOpType::Sum => 1.0,
            ReduceOpType::Mean => 1.0 / self.reduction_size as f32,
        }
    }
}

impl OpShapeInference for ReduceAttrs {
    fn output_shapes(
        &self,
        inputs: &[TensorShape],
        weights: &[TensorShape],
    ) -> Result<RVec<TensorShape>, ShapeError> {
        check_arity("Reduce", inputs, 1)?;
        check_arity("Reduce", weights, 0)?;
        let input = &inputs[0];
        for &axis in self.axes.iter() {
            check_dim(input, axis)?;
        }
        if !self.axes.iter().all_unique() {
            return Err(ShapeError::InvalidAttrs {
                op: "Reduce",
                reason: format!("repeated axes in {:?}", self.axes),
            });
        }
        let mut dims = input.dims.clone();
        for &axis in self.axes.iter().sorted().rev() {
            if self.keep_dims {
                dims[axis] = 1;
            } else {
                dims.remove(axis);
            }
        }
        Ok(rvec![input.with_dims(dims)])
    }
}

impl OpTaskInvocations for ReduceAttrs {
    fn task_ids(&self) -> RVec<TaskId> {
        rvec![TaskId::ReduceInit, TaskId::ReduceFwd, TaskId::ReduceBwd]
    }

    fn init(&self) -> Result<Option<TaskInvocation>, BindingError> {
        let mut b = OpTaskBinding::default();
        b.bind_runtime_arg(HANDLE, device_handle())?;
        b.bind_arg(ATTRS, self.clone())?;
        b.bind(INPUT, input_tensor(0))?;
        b.bind(OUTPUT, output_tensor(0))?;
        Ok(Some(TaskInvocation::new(TaskId::ReduceInit, b)))
    }

    fn forward(&self) -> Result<TaskInvocation, BindingError> {
        let mut b = OpTaskBinding::default();
        b.bind_op_arg(
            PER_DEVICE_STATE,
            per_device_op_state::<ReducePerDeviceState>(),
        )?;
        b.bind_runtime_arg(PROFILING, profiling_settings())?;
        b.bind(INPUT, input_tensor(0))?;
        b.bind(OUTPUT, output_tensor(0))?;
        Ok(TaskInvocation::new(TaskId::ReduceFwd, b))
    }

    fn backward(&self) -> Result<TaskInvocation, BindingError> {
        let fwd = self.forward()?;
        Ok(TaskInvocation::new(
            TaskId::ReduceBwd,
            infer_bwd_binding(&fwd.binding),
        ))
    }
}

impl Operator for ReduceAttrs {
    fn name(&self) -> &'static str {
        "Reduce"
    }
}

fn init_task_impl(acc: &TaskArgumentAccessor) -> Result<DeviceSpecific<DeviceStates>, TaskError> {
    let handle = acc.get_argument::<PerDeviceHandle>(HANDLE)?;
    let attrs = acc.get_argument::<ReduceAttrs>(ATTRS)?;
    let input = acc.get_tensor(INPUT, Permissions::RO)?;
    let output = acc.get_tensor(OUTPUT, Permissions::WO)?;
    log::trace!(
        "Reduce init: {} over {:?}, workspace {}",
        attrs.op_type,
        attrs.axes,
        handle.workspace_size
    );

    let state = ReducePerDeviceState {
        op_type: attrs.op_type,
        reduction_size: input.numel() / output.numel().max(1),
        input_dims: input.dims().clone(),
        axes: attrs.axes,
    };
    Ok(DeviceSpecific::create(
        acc.device_idx(),
        ConcreteArg::create(state),
    ))
}

fn forward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let state = acc.get_argument::<ReducePerDeviceState>(PER_DEVICE_STATE)?;
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let input = acc.get_tensor(INPUT, Permissions::RO)?;
    let output = acc.get_tensor(OUTPUT, Permissions::WO)?;
    let indexer = ReduceIndexer::new(&state.input_dims, &state.axes);

    profile(&profiling, "[Reduce] forward_time", || {
        indexer.forward(
            &input.read::<f32>()?,
            state.scale(),
            &mut output.write::<f32>()?,
        );
        Ok(())
    })
}

fn backward_task_impl(acc: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
    let state = acc.get_argument::<ReducePerDeviceState>(PER_DEVICE_STATE)?;
    let profiling = acc.get_argument::<ProfilingSettings>(PROFILING)?;
    let input_grad = acc.get_tensor_grad(INPUT, Permissions::RW)?;
    let output_grad = acc.get_tensor_grad(OUTPUT, Permissions::RO)?;
    let indexer = ReduceIndexer::new(&state.input_dims, &state.axes);

    profile_accumulating(&profiling, "[Reduce] backward_time", &[&input_grad], || {
        indexer.backward(
            &output_grad.read::<f32>()?,
            state.scale(),
            &mut input_grad.write::<f32>()?,
        );
        Ok(())
    })
}

fn init_signature() -> OpTaskSignature {
    let mut init = OpTaskSignature::new(OpTaskType::Init);
    init.add_unchecked_arg_slot::<PerDeviceHandle>(HANDLE);
    init.add_arg_slot::<ReduceAttrs>(ATTRS);
    init.add_input_slot(INPUT);
    init.add_output_slot(OUTPUT);
    init.add_return_value::<ReducePerDeviceState>();
    init
}

fn fwd_signature() -> OpTaskSignature {
    let mut fwd = OpTaskSignature::new(OpTaskType::Fwd);
    fwd.add_unchecked_arg_slot::<ReducePerDeviceState>(PER_DEVICE_STATE);
    fwd.add_arg_slot::<ProfilingSettings>(PROFILING);
    fwd.add_input_slot(INPUT);
    fwd.add_output_slot(OUTPUT);
    fwd
}

pub(crate) fn init_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::ReduceInit.into(),
        impl_function: TaskImplFunction::Init(init_task_impl),
        task_signature: init_signature(),
    }
}

pub(crate) fn fwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::ReduceFwd.into(),
        impl_function: TaskImplFunction::FwdBwd(forward_task_impl),
        task_signature: fwd_signature(),
    }
}

pub(crate) fn bwd_task_sig_impl() -> TaskSignatureAndImpl {
    TaskSignatureAndImpl {
        name: TaskId::ReduceBwd.into(),
        impl_function: TaskImplFunction::FwdBwd(backward_task_impl),
        task_signature: infer_bwd_signature(&fwd_signature()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ops::tests::assert_invocations_valid, shape};
    use test_strategy::proptest;

    #[proptest]
    fn invocations_match_signatures(op_type: ReduceOpType, keep_dims: bool) {
        assert_invocations_valid(&ReduceAttrs::new(rvec![0], op_type, keep_dims));
    }

    #[test]
    fn output_shapes() {
        let input = TensorShape::f32(shape![2, 3, 4]);
        let kept = ReduceAttrs::new(rvec![2, 0], ReduceOpType::Sum, true);
        assert_eq!(
            kept.output_shapes(&[input.clone()], &[]).unwrap()[0],
            TensorShape::f32(shape![1, 3, 1])
        );
        let dropped = ReduceAttrs::new(rvec![2, 0], ReduceOpType::Mean, false);
        assert_eq!(
            dropped.output_shapes(&[input.clone()], &[]).unwrap()[0],
            TensorShape::f32(shape![3])
        );
        let repeated = ReduceAttrs::new(rvec![1, 1], ReduceOpType::Sum, false);
        assert!(repeated.output_shapes(&[input], &[]).is_err());
    }

    #[test]
    fn mean_scales_by_reduction_size() {
        let state = ReducePerDeviceState {
            op_type: ReduceOpType::Mean,
            reduction_size: 4,
            input_dims: shape![4],
            axes: rvec![0],
        };
        assert_eq!(state.scale(), 0.25);
    }
}
