use derive_new::new;
use rustc_hash::FxHashMap;

use crate::{
    ArgValue, ConcreteArg, IsGrad, OpArgRef, OpArgRefSpec, OpArgSpec, OpTensorSpec,
    RuntimeArgRef, RuntimeArgRefSpec, SlotId, TaskId,
};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("Tensor slot {slot} (grad: {is_grad:?}) is already bound")]
    DuplicateTensorSlot { slot: SlotId, is_grad: IsGrad },
    #[error("Argument slot {0} is already bound")]
    DuplicateArgSlot(SlotId),
}

/// Declarative assignment of an operator's tensors and arguments to the
/// slots of one task.
///
/// A binding never refers to a concrete buffer. Tensors are named by role and
/// position within the owning operator, arguments either carry their value or
/// name where to fetch it at dispatch time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpTaskBinding {
    tensor_bindings: FxHashMap<(SlotId, IsGrad), OpTensorSpec>,
    arg_bindings: FxHashMap<SlotId, OpArgSpec>,
}

impl OpTaskBinding {
    pub fn bind(&mut self, slot: SlotId, spec: OpTensorSpec) -> Result<(), BindingError> {
        self.insert_tensor(slot, IsGrad::No, spec)
    }

    pub fn bind_grad(&mut self, slot: SlotId, spec: OpTensorSpec) -> Result<(), BindingError> {
        self.insert_tensor(slot, IsGrad::Yes, spec)
    }

    pub fn bind_arg<T: ArgValue>(&mut self, slot: SlotId, value: T) -> Result<(), BindingError> {
        self.insert_arg(slot, OpArgSpec::Concrete(ConcreteArg::create(value)))
    }

    pub fn bind_op_arg<T: 'static>(
        &mut self,
        slot: SlotId,
        arg_ref: OpArgRef<T>,
    ) -> Result<(), BindingError> {
        self.insert_arg(slot, OpArgSpec::OpRef(OpArgRefSpec::create(arg_ref)))
    }

    pub fn bind_runtime_arg<T: 'static>(
        &mut self,
        slot: SlotId,
        arg_ref: RuntimeArgRef<T>,
    ) -> Result<(), BindingError> {
        self.insert_arg(slot, OpArgSpec::RuntimeRef(RuntimeArgRefSpec::create(arg_ref)))
    }

    /// Copy every argument binding of `fwd` into this binding, replacing any
    /// existing entry for the same slot.
    pub fn bind_args_from_fwd(&mut self, fwd: &OpTaskBinding) {
        self.arg_bindings
            .extend(fwd.arg_bindings.iter().map(|(k, v)| (*k, v.clone())));
    }

    /// Copy every tensor binding of `fwd` into this binding, replacing any
    /// existing entry for the same key.
    pub fn bind_tensors_from_fwd(&mut self, fwd: &OpTaskBinding) {
        self.tensor_bindings
            .extend(fwd.tensor_bindings.iter().map(|(k, v)| (*k, *v)));
    }

    pub fn tensor_bindings(&self) -> &FxHashMap<(SlotId, IsGrad), OpTensorSpec> {
        &self.tensor_bindings
    }

    pub fn arg_bindings(&self) -> &FxHashMap<SlotId, OpArgSpec> {
        &self.arg_bindings
    }

    pub fn get_tensor(&self, slot: SlotId, is_grad: IsGrad) -> Option<&OpTensorSpec> {
        self.tensor_bindings.get(&(slot, is_grad))
    }

    pub fn get_arg(&self, slot: SlotId) -> Option<&OpArgSpec> {
        self.arg_bindings.get(&slot)
    }

    fn insert_tensor(
        &mut self,
        slot: SlotId,
        is_grad: IsGrad,
        spec: OpTensorSpec,
    ) -> Result<(), BindingError> {
        if self.tensor_bindings.contains_key(&(slot, is_grad)) {
            return Err(BindingError::DuplicateTensorSlot { slot, is_grad });
        }
        self.tensor_bindings.insert((slot, is_grad), spec);
        Ok(())
    }

    fn insert_arg(&mut self, slot: SlotId, spec: OpArgSpec) -> Result<(), BindingError> {
        if self.arg_bindings.contains_key(&slot) {
            return Err(BindingError::DuplicateArgSlot(slot));
        }
        self.arg_bindings.insert(slot, spec);
        Ok(())
    }
}

/// A task id paired with the binding to run it with.
#[derive(Debug, Clone, PartialEq, new)]
pub struct TaskInvocation {
    pub task_id: TaskId,
    pub binding: OpTaskBinding,
}

/// Backward binding of a forward binding: every forward tensor and argument
/// binding is kept, and each non-gradient tensor binding gains a gradient twin.
pub fn infer_bwd_binding(fwd: &OpTaskBinding) -> OpTaskBinding {
    let mut bwd = OpTaskBinding::default();
    bwd.bind_args_from_fwd(fwd);
    bwd.bind_tensors_from_fwd(fwd);
    for (&(slot, is_grad), spec) in fwd.tensor_bindings.iter() {
        if is_grad == IsGrad::No {
            bwd.tensor_bindings.insert((slot, IsGrad::Yes), *spec);
        }
    }
    bwd
}
