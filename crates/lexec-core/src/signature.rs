use rustc_hash::FxHashMap;

use crate::{
    ArgTypeTag, IsGrad, OpSlotOptions, Permissions, SlotId, SlotType, TaskInvocation, TensorRole,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum OpTaskType {
    Init,
    Fwd,
    Bwd,
}

/// Declaration of one tensor slot a task expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpTensorSlotSpec {
    pub name: SlotId,
    pub slot_type: SlotType,
    pub tensor_role: TensorRole,
    pub is_grad: IsGrad,
    pub slot_option: OpSlotOptions,
    pub permissions: Permissions,
}

impl OpTensorSlotSpec {
    /// Spec with the default permission for its role: inputs and weights are
    /// read, outputs written. Input and weight gradients are accumulated into,
    /// output gradients only read.
    pub fn new(
        name: SlotId,
        slot_type: SlotType,
        tensor_role: TensorRole,
        is_grad: IsGrad,
        slot_option: OpSlotOptions,
    ) -> Self {
        Self {
            name,
            slot_type,
            tensor_role,
            is_grad,
            slot_option,
            permissions: default_permissions(tensor_role, is_grad),
        }
    }
}

fn default_permissions(role: TensorRole, is_grad: IsGrad) -> Permissions {
    match (role, is_grad) {
        (TensorRole::Output, IsGrad::No) => Permissions::WO,
        (TensorRole::Output, IsGrad::Yes) => Permissions::RO,
        (_, IsGrad::No) => Permissions::RO,
        (_, IsGrad::Yes) => Permissions::RW,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArgSlotSpec {
    pub type_tag: ArgTypeTag,
    /// Unchecked slots may be absent from a binding.
    pub checked: bool,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required tensor slot {slot} (grad: {is_grad:?}) is not bound")]
    MissingTensorSlot { slot: SlotId, is_grad: IsGrad },
    #[error("Tensor slot {slot} expects role {expected}, bound to {actual}")]
    RoleMismatch {
        slot: SlotId,
        expected: TensorRole,
        actual: TensorRole,
    },
    #[error("Tensor slot {slot} expects a {expected} binding, got {actual}")]
    SlotTypeMismatch {
        slot: SlotId,
        expected: SlotType,
        actual: SlotType,
    },
    #[error("Required argument slot {0} is not bound")]
    MissingArgSlot(SlotId),
    #[error("Argument slot {slot} expects {expected:?}, bound to {actual:?}")]
    ArgTypeMismatch {
        slot: SlotId,
        expected: ArgTypeTag,
        actual: ArgTypeTag,
    },
}

/// Declarative contract of a task: the tensors it touches, with which
/// permissions, the typed arguments it reads and, for init tasks, the type
/// of the state it returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpTaskSignature {
    task_type: OpTaskType,
    return_value: Option<ArgTypeTag>,
    tensor_slots: FxHashMap<(SlotId, IsGrad), OpTensorSlotSpec>,
    arg_slots: FxHashMap<SlotId, ArgSlotSpec>,
}

impl OpTaskSignature {
    pub fn new(task_type: OpTaskType) -> Self {
        Self {
            task_type,
            return_value: None,
            tensor_slots: FxHashMap::default(),
            arg_slots: FxHashMap::default(),
        }
    }

    pub fn add_slot(&mut self, spec: OpTensorSlotSpec) {
        self.tensor_slots.insert((spec.name, spec.is_grad), spec);
    }

    fn add_tensor_slot(
        &mut self,
        name: SlotId,
        slot_type: SlotType,
        role: TensorRole,
        is_grad: IsGrad,
        slot_option: OpSlotOptions,
    ) {
        self.add_slot(OpTensorSlotSpec::new(
            name,
            slot_type,
            role,
            is_grad,
            slot_option,
        ));
    }

    pub fn add_input_slot(&mut self, name: SlotId) {
        self.add_input_slot_with(name, SlotType::Tensor);
    }

    pub fn add_input_slot_with(&mut self, name: SlotId, slot_type: SlotType) {
        self.add_tensor_slot(
            name,
            slot_type,
            TensorRole::Input,
            IsGrad::No,
            OpSlotOptions::Necessary,
        );
    }

    pub fn add_optional_input_slot(&mut self, name: SlotId) {
        self.add_tensor_slot(
            name,
            SlotType::Tensor,
            TensorRole::Input,
            IsGrad::No,
            OpSlotOptions::Optional,
        );
    }

    pub fn add_untrainable_input_slot(&mut self, name: SlotId) {
        self.add_tensor_slot(
            name,
            SlotType::Tensor,
            TensorRole::Input,
            IsGrad::No,
            OpSlotOptions::Untrainable,
        );
    }

    pub fn add_optional_untrainable_input_slot(&mut self, name: SlotId) {
        self.add_tensor_slot(
            name,
            SlotType::Tensor,
            TensorRole::Input,
            IsGrad::No,
            OpSlotOptions::OptionalUntrainable,
        );
    }

    pub fn add_weight_slot(&mut self, name: SlotId) {
        self.add_tensor_slot(
            name,
            SlotType::Tensor,
            TensorRole::Weight,
            IsGrad::No,
            OpSlotOptions::Necessary,
        );
    }

    pub fn add_output_slot(&mut self, name: SlotId) {
        self.add_output_slot_with(name, SlotType::Tensor);
    }

    pub fn add_output_slot_with(&mut self, name: SlotId, slot_type: SlotType) {
        self.add_tensor_slot(
            name,
            slot_type,
            TensorRole::Output,
            IsGrad::No,
            OpSlotOptions::Necessary,
        );
    }

    /// Output slot that backward tasks may leave unbound.
    pub fn add_bwd_optional_output_slot(&mut self, name: SlotId) {
        self.add_tensor_slot(
            name,
            SlotType::Tensor,
            TensorRole::Output,
            IsGrad::No,
            OpSlotOptions::Optional,
        );
    }

    pub fn add_input_grad_slot(&mut self, name: SlotId, slot_type: SlotType) {
        self.add_tensor_slot(
            name,
            slot_type,
            TensorRole::Input,
            IsGrad::Yes,
            OpSlotOptions::Necessary,
        );
    }

    pub fn add_output_grad_slot(&mut self, name: SlotId, slot_type: SlotType) {
        self.add_tensor_slot(
            name,
            slot_type,
            TensorRole::Output,
            IsGrad::Yes,
            OpSlotOptions::Necessary,
        );
    }

    pub fn add_arg_slot<T: 'static>(&mut self, name: SlotId) {
        self.arg_slots.insert(
            name,
            ArgSlotSpec {
                type_tag: ArgTypeTag::of::<T>(),
                checked: true,
            },
        );
    }

    /// Argument slot the task may read but that a binding is not required
    /// to provide.
    pub fn add_unchecked_arg_slot<T: 'static>(&mut self, name: SlotId) {
        self.arg_slots.insert(
            name,
            ArgSlotSpec {
                type_tag: ArgTypeTag::of::<T>(),
                checked: false,
            },
        );
    }

    pub fn add_return_value<T: 'static>(&mut self) {
        self.return_value = Some(ArgTypeTag::of::<T>());
    }

    pub fn task_type(&self) -> OpTaskType {
        self.task_type
    }

    pub fn return_value(&self) -> Option<ArgTypeTag> {
        self.return_value
    }

    pub fn tensor_slots(&self) -> impl Iterator<Item = &OpTensorSlotSpec> {
        self.tensor_slots.values()
    }

    pub fn tensor_slot(&self, name: SlotId, is_grad: IsGrad) -> Option<&OpTensorSlotSpec> {
        self.tensor_slots.get(&(name, is_grad))
    }

    pub fn arg_slots(&self) -> &FxHashMap<SlotId, ArgSlotSpec> {
        &self.arg_slots
    }

    pub fn arg_slot(&self, name: SlotId) -> Option<&ArgSlotSpec> {
        self.arg_slots.get(&name)
    }
}

/// Backward signature of a forward signature.
///
/// Every forward tensor slot is kept as a read-only slot. Trainable slots
/// also gain a gradient twin with the same name, slot type and role.
/// Argument slots are copied.
pub fn infer_bwd_signature(fwd: &OpTaskSignature) -> OpTaskSignature {
    let mut bwd = OpTaskSignature::new(OpTaskType::Bwd);
    for spec in fwd.tensor_slots().filter(|s| s.is_grad == IsGrad::No) {
        bwd.add_slot(OpTensorSlotSpec {
            permissions: Permissions::RO,
            ..*spec
        });
        if !spec.slot_option.is_trainable() {
            continue;
        }
        bwd.add_slot(OpTensorSlotSpec::new(
            spec.name,
            spec.slot_type,
            spec.tensor_role,
            IsGrad::Yes,
            spec.slot_option,
        ));
    }
    bwd.arg_slots = fwd.arg_slots.clone();
    bwd
}

/// Check an invocation against a signature.
///
/// Every non-optional tensor slot and every checked argument slot must be
/// bound, tensor bindings must agree on role and slot type and bound
/// arguments must carry the declared type. Bindings the signature does not
/// mention are ignored.
pub fn validate_invocation(
    signature: &OpTaskSignature,
    invocation: &TaskInvocation,
) -> Result<(), ValidationError> {
    let binding = &invocation.binding;
    for spec in signature.tensor_slots() {
        let Some(bound) = binding.get_tensor(spec.name, spec.is_grad) else {
            if spec.slot_option.is_optional() {
                continue;
            }
            return Err(ValidationError::MissingTensorSlot {
                slot: spec.name,
                is_grad: spec.is_grad,
            });
        };
        if bound.role != spec.tensor_role {
            return Err(ValidationError::RoleMismatch {
                slot: spec.name,
                expected: spec.tensor_role,
                actual: bound.role,
            });
        }
        if bound.slot_type() != spec.slot_type {
            return Err(ValidationError::SlotTypeMismatch {
                slot: spec.name,
                expected: spec.slot_type,
                actual: bound.slot_type(),
            });
        }
    }

    for (&slot, spec) in signature.arg_slots() {
        match binding.get_arg(slot) {
            None if spec.checked => return Err(ValidationError::MissingArgSlot(slot)),
            None => {}
            Some(arg) if arg.type_tag() != spec.type_tag => {
                return Err(ValidationError::ArgTypeMismatch {
                    slot,
                    expected: spec.type_tag,
                    actual: arg.type_tag(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

pub fn is_invocation_valid(signature: &OpTaskSignature, invocation: &TaskInvocation) -> bool {
    match validate_invocation(signature, invocation) {
        Ok(()) => true,
        Err(e) => {
            log::debug!("Invalid invocation of {}: {}", invocation.task_id, e);
            false
        }
    }
}
