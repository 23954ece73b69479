use rustc_hash::FxHashMap;

use crate::{
    ArgTypeMismatch, ConcreteArg, DeviceError, GenericTensorAccessor, IsGrad, LayerGuid,
    Permissions, RVec, SlotId, TensorError, TensorGuid, TensorRole,
};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AccessorError {
    #[error("Tensor slot {slot} (grad: {is_grad:?}) is not bound")]
    MissingTensorSlot { slot: SlotId, is_grad: IsGrad },
    #[error("Argument slot {0} is not bound")]
    MissingArgSlot(SlotId),
    #[error("Argument slot {slot}: {source}")]
    ArgType {
        slot: SlotId,
        #[source]
        source: ArgTypeMismatch,
    },
    #[error("Tensor slot {0} holds a single tensor, not a variadic list")]
    NotVariadic(SlotId),
    #[error("Tensor slot {0} holds a variadic list, not a single tensor")]
    IsVariadic(SlotId),
    #[error("Layer {layer:?} has no {role} tensor at index {idx}")]
    MissingLayerTensor {
        layer: LayerGuid,
        role: TensorRole,
        idx: usize,
    },
    #[error("Layer {0:?} has no recorded tensors")]
    UnknownLayer(LayerGuid),
    #[error("Tensor {tensor:?} (grad: {is_grad:?}) has no backing buffer")]
    MissingTensorBacking { tensor: TensorGuid, is_grad: IsGrad },
    #[error("Layer {0:?} has no per-device state")]
    MissingPerDeviceState(LayerGuid),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Resolved contents of one tensor slot.
#[derive(Debug, Clone)]
pub enum TensorSlotBacking {
    Single(GenericTensorAccessor),
    Variadic(RVec<GenericTensorAccessor>),
}

pub type TensorSlotsBacking = FxHashMap<(SlotId, IsGrad), TensorSlotBacking>;
pub type ArgSlotsBacking = FxHashMap<SlotId, ConcreteArg>;

/// The only view a task implementation has of the runtime.
///
/// Built fresh for every dispatch from a binding resolved against the
/// current buffers and argument values. Tensor handles are capped at the
/// permissions the task's signature granted.
#[derive(Debug)]
pub struct TaskArgumentAccessor {
    tensor_slots: TensorSlotsBacking,
    arg_slots: ArgSlotsBacking,
    device_idx: usize,
}

impl TaskArgumentAccessor {
    pub fn new(
        tensor_slots: TensorSlotsBacking,
        arg_slots: ArgSlotsBacking,
        device_idx: usize,
    ) -> Self {
        Self {
            tensor_slots,
            arg_slots,
            device_idx,
        }
    }

    pub fn get_argument<T: Clone + 'static>(&self, slot: SlotId) -> Result<T, AccessorError> {
        self.arg_slots
            .get(&slot)
            .ok_or(AccessorError::MissingArgSlot(slot))?
            .get::<T>()
            .cloned()
            .map_err(|source| AccessorError::ArgType { slot, source })
    }

    pub fn get_tensor(
        &self,
        slot: SlotId,
        permissions: Permissions,
    ) -> Result<GenericTensorAccessor, AccessorError> {
        self.single(slot, IsGrad::No, permissions)
    }

    pub fn get_tensor_grad(
        &self,
        slot: SlotId,
        permissions: Permissions,
    ) -> Result<GenericTensorAccessor, AccessorError> {
        self.single(slot, IsGrad::Yes, permissions)
    }

    pub fn get_variadic_tensor(
        &self,
        slot: SlotId,
        permissions: Permissions,
    ) -> Result<RVec<GenericTensorAccessor>, AccessorError> {
        self.variadic(slot, IsGrad::No, permissions)
    }

    pub fn get_variadic_tensor_grad(
        &self,
        slot: SlotId,
        permissions: Permissions,
    ) -> Result<RVec<GenericTensorAccessor>, AccessorError> {
        self.variadic(slot, IsGrad::Yes, permissions)
    }

    pub fn device_idx(&self) -> usize {
        self.device_idx
    }

    fn slot(&self, slot: SlotId, is_grad: IsGrad) -> Result<&TensorSlotBacking, AccessorError> {
        self.tensor_slots
            .get(&(slot, is_grad))
            .ok_or(AccessorError::MissingTensorSlot { slot, is_grad })
    }

    fn single(
        &self,
        slot: SlotId,
        is_grad: IsGrad,
        permissions: Permissions,
    ) -> Result<GenericTensorAccessor, AccessorError> {
        match self.slot(slot, is_grad)? {
            TensorSlotBacking::Single(t) => Ok(t.restrict(permissions)?),
            TensorSlotBacking::Variadic(_) => Err(AccessorError::IsVariadic(slot)),
        }
    }

    fn variadic(
        &self,
        slot: SlotId,
        is_grad: IsGrad,
        permissions: Permissions,
    ) -> Result<RVec<GenericTensorAccessor>, AccessorError> {
        match self.slot(slot, is_grad)? {
            TensorSlotBacking::Variadic(ts) => Ok(ts
                .iter()
                .map(|t| t.restrict(permissions))
                .collect::<Result<_, _>>()?),
            TensorSlotBacking::Single(_) => Err(AccessorError::NotVariadic(slot)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{get_local_memory_allocator, rvec, shape, Allocator, ArgTypeTag, TensorShape};

    const X: SlotId = SlotId::new(0);
    const YS: SlotId = SlotId::new(1);
    const ATTRS: SlotId = SlotId::new(2);

    fn accessor() -> anyhow::Result<TaskArgumentAccessor> {
        let allocator = get_local_memory_allocator();
        let x = allocator.allocate_tensor(&TensorShape::f32(shape![2]))?;
        let y = allocator.allocate_tensor(&TensorShape::f32(shape![3]))?;
        let mut tensors = TensorSlotsBacking::default();
        tensors.insert(
            (X, IsGrad::No),
            TensorSlotBacking::Single(x.restrict(Permissions::RO)?),
        );
        tensors.insert(
            (YS, IsGrad::Yes),
            TensorSlotBacking::Variadic(rvec![y.clone(), y]),
        );
        let mut args = ArgSlotsBacking::default();
        args.insert(ATTRS, ConcreteArg::create(4usize));
        Ok(TaskArgumentAccessor::new(tensors, args, 0))
    }

    #[test]
    fn arguments_are_type_checked() -> anyhow::Result<()> {
        let acc = accessor()?;
        assert_eq!(acc.get_argument::<usize>(ATTRS)?, 4);
        assert_eq!(
            acc.get_argument::<f32>(ATTRS),
            Err(AccessorError::ArgType {
                slot: ATTRS,
                source: ArgTypeMismatch {
                    expected: ArgTypeTag::of::<f32>(),
                    actual: ArgTypeTag::of::<usize>()
                }
            })
        );
        assert_eq!(
            acc.get_argument::<usize>(YS),
            Err(AccessorError::MissingArgSlot(YS))
        );
        Ok(())
    }

    #[test]
    fn permissions_cannot_be_widened() -> anyhow::Result<()> {
        let acc = accessor()?;
        assert!(acc.get_tensor(X, Permissions::RO).is_ok());
        assert!(matches!(
            acc.get_tensor(X, Permissions::RW),
            Err(AccessorError::Tensor(TensorError::PrivilegeViolation { .. }))
        ));
        assert_eq!(
            acc.get_tensor_grad(X, Permissions::RO).err(),
            Some(AccessorError::MissingTensorSlot {
                slot: X,
                is_grad: IsGrad::Yes
            })
        );
        Ok(())
    }

    #[test]
    fn variadic_slots_are_distinct() -> anyhow::Result<()> {
        let acc = accessor()?;
        assert_eq!(acc.get_variadic_tensor_grad(YS, Permissions::RW)?.len(), 2);
        assert_eq!(
            acc.get_tensor_grad(YS, Permissions::RO).err(),
            Some(AccessorError::IsVariadic(YS))
        );
        assert_eq!(
            acc.get_variadic_tensor(X, Permissions::RO).err(),
            Some(AccessorError::NotVariadic(X))
        );
        Ok(())
    }
}
