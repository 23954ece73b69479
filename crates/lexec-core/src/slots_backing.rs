use rustc_hash::FxHashMap;

use crate::{
    AccessorError, AllocatorError, ArgSlotsBacking, ArgTypeMismatch, ConcreteArg, DeviceSpecific,
    DeviceStates, GenericTensorAccessor, IsGrad, LayerGuid, OpArgRefSpec, OpArgRefType,
    OpArgSpec, OpTaskBinding, OpTaskSignature, Permissions, RVec, RuntimeArgConfig,
    RuntimeArgRefSpec, RuntimeArgRefType, SlotId, TensorGuid, TensorRole, TensorSelector,
    TensorSlotBacking, TensorSlotsBacking,
};

pub type TensorBackingMap = FxHashMap<TensorGuid, GenericTensorAccessor>;

/// Everything a binding is resolved against: tensor and gradient buffers,
/// each layer's tensors by role, per-device operator state and the runtime
/// argument config.
#[derive(Debug)]
pub struct LocalSlotsBacking {
    tensor_mapping: TensorBackingMap,
    gradient_tensor_mapping: TensorBackingMap,
    input_tensor_slots: FxHashMap<LayerGuid, RVec<TensorGuid>>,
    weight_tensor_slots: FxHashMap<LayerGuid, RVec<TensorGuid>>,
    output_tensor_slots: FxHashMap<LayerGuid, RVec<TensorGuid>>,
    per_device_op_states: FxHashMap<LayerGuid, DeviceSpecific<DeviceStates>>,
    runtime_arg_config: RuntimeArgConfig,
}

impl LocalSlotsBacking {
    pub fn new(tensor_mapping: TensorBackingMap, runtime_arg_config: RuntimeArgConfig) -> Self {
        Self {
            tensor_mapping,
            gradient_tensor_mapping: TensorBackingMap::default(),
            input_tensor_slots: FxHashMap::default(),
            weight_tensor_slots: FxHashMap::default(),
            output_tensor_slots: FxHashMap::default(),
            per_device_op_states: FxHashMap::default(),
            runtime_arg_config,
        }
    }

    pub fn runtime_arg_config(&self) -> &RuntimeArgConfig {
        &self.runtime_arg_config
    }

    pub fn device_idx(&self) -> usize {
        self.runtime_arg_config.device_idx()
    }

    fn mapping(&self, is_grad: IsGrad) -> &TensorBackingMap {
        match is_grad {
            IsGrad::No => &self.tensor_mapping,
            IsGrad::Yes => &self.gradient_tensor_mapping,
        }
    }

    pub fn is_allocated(&self, tensor: TensorGuid, is_grad: IsGrad) -> bool {
        self.mapping(is_grad).contains_key(&tensor)
    }

    pub fn get_backing(&self, tensor: TensorGuid, is_grad: IsGrad) -> Option<&GenericTensorAccessor> {
        self.mapping(is_grad).get(&tensor)
    }

    /// Record a buffer for `tensor`. A tensor that already has a buffer keeps
    /// it, provided the shapes agree.
    pub fn insert_backing(
        &mut self,
        tensor: TensorGuid,
        is_grad: IsGrad,
        backing: GenericTensorAccessor,
    ) -> Result<(), AllocatorError> {
        let mapping = match is_grad {
            IsGrad::No => &mut self.tensor_mapping,
            IsGrad::Yes => &mut self.gradient_tensor_mapping,
        };
        if let Some(existing) = mapping.get(&tensor) {
            return check_shape(existing, backing.shape());
        }
        mapping.insert(tensor, backing);
        Ok(())
    }

    pub fn set_layer_tensors(
        &mut self,
        layer: LayerGuid,
        inputs: &[TensorGuid],
        weights: &[TensorGuid],
        outputs: &[TensorGuid],
    ) {
        self.input_tensor_slots.insert(layer, inputs.into());
        self.weight_tensor_slots.insert(layer, weights.into());
        self.output_tensor_slots.insert(layer, outputs.into());
    }

    pub fn layer_tensors(
        &self,
        layer: LayerGuid,
        role: TensorRole,
    ) -> Result<&[TensorGuid], AccessorError> {
        let slots = match role {
            TensorRole::Input => &self.input_tensor_slots,
            TensorRole::Weight => &self.weight_tensor_slots,
            TensorRole::Output => &self.output_tensor_slots,
        };
        slots
            .get(&layer)
            .map(|ts| ts.as_slice())
            .ok_or(AccessorError::UnknownLayer(layer))
    }

    pub fn add_per_device_op_state(&mut self, layer: LayerGuid, state: DeviceSpecific<DeviceStates>) {
        self.per_device_op_states.insert(layer, state);
    }

    pub fn per_device_op_state(&self, layer: LayerGuid) -> Option<&DeviceSpecific<DeviceStates>> {
        self.per_device_op_states.get(&layer)
    }

    pub fn tensor_backings(&self) -> &TensorBackingMap {
        &self.tensor_mapping
    }

    pub fn gradient_backings(&self) -> &TensorBackingMap {
        &self.gradient_tensor_mapping
    }

    fn lookup(
        &self,
        tensor: TensorGuid,
        is_grad: IsGrad,
        permissions: Permissions,
    ) -> Result<GenericTensorAccessor, AccessorError> {
        let backing = self
            .get_backing(tensor, is_grad)
            .ok_or(AccessorError::MissingTensorBacking { tensor, is_grad })?;
        Ok(backing.restrict(permissions)?)
    }

    /// Resolve every tensor binding to buffers of `layer`, each capped at the
    /// permission the signature declares for its slot. Bound slots the
    /// signature does not declare are read-only.
    pub fn construct_tensor_slots_backing(
        &self,
        binding: &OpTaskBinding,
        layer: LayerGuid,
        signature: &OpTaskSignature,
    ) -> Result<TensorSlotsBacking, AccessorError> {
        let mut backing = TensorSlotsBacking::default();
        for (&(slot, is_grad), spec) in binding.tensor_bindings() {
            let permissions = signature
                .tensor_slot(slot, is_grad)
                .map_or(Permissions::RO, |s| s.permissions);
            let tensors = self.layer_tensors(layer, spec.role)?;
            let resolved = match spec.selector {
                TensorSelector::Index(idx) => {
                    let tensor = tensors.get(idx).ok_or(AccessorError::MissingLayerTensor {
                        layer,
                        role: spec.role,
                        idx,
                    })?;
                    TensorSlotBacking::Single(self.lookup(*tensor, is_grad, permissions)?)
                }
                TensorSelector::All => TensorSlotBacking::Variadic(
                    tensors
                        .iter()
                        .map(|t| self.lookup(*t, is_grad, permissions))
                        .collect::<Result<_, _>>()?,
                ),
            };
            backing.insert((slot, is_grad), resolved);
        }
        Ok(backing)
    }

    pub fn construct_arg_slots_backing(
        &self,
        binding: &OpTaskBinding,
        layer: LayerGuid,
    ) -> Result<ArgSlotsBacking, AccessorError> {
        let mut backing = ArgSlotsBacking::default();
        for (&slot, spec) in binding.arg_bindings() {
            let value = match spec {
                OpArgSpec::Concrete(arg) => arg.clone(),
                OpArgSpec::OpRef(r) => self.resolve_op_arg_ref_spec(r, layer)?,
                OpArgSpec::RuntimeRef(r) => self.resolve_runtime_arg_ref_spec(r)?,
            };
            check_arg_type(slot, spec, &value)?;
            backing.insert(slot, value);
        }
        Ok(backing)
    }

    pub fn resolve_op_arg_ref_spec(
        &self,
        spec: &OpArgRefSpec,
        layer: LayerGuid,
    ) -> Result<ConcreteArg, AccessorError> {
        let shape_of = |role, idx: usize| -> Result<ConcreteArg, AccessorError> {
            let tensor = self
                .layer_tensors(layer, role)?
                .get(idx)
                .ok_or(AccessorError::MissingLayerTensor { layer, role, idx })?;
            let backing = self.lookup(*tensor, IsGrad::No, Permissions::RO)?;
            Ok(ConcreteArg::create(backing.shape().clone()))
        };
        match spec.ref_type {
            OpArgRefType::PerDeviceOpState => Ok(self
                .per_device_op_state(layer)
                .ok_or(AccessorError::MissingPerDeviceState(layer))?
                .get(self.device_idx())?
                .clone()),
            OpArgRefType::InputTensorShape(idx) => shape_of(TensorRole::Input, idx),
            OpArgRefType::OutputTensorShape(idx) => shape_of(TensorRole::Output, idx),
        }
    }

    pub fn resolve_runtime_arg_ref_spec(
        &self,
        spec: &RuntimeArgRefSpec,
    ) -> Result<ConcreteArg, AccessorError> {
        let config = &self.runtime_arg_config;
        match spec.ref_type {
            RuntimeArgRefType::Handle => Ok(ConcreteArg::create(
                config.handle.get(self.device_idx())?.clone(),
            )),
            RuntimeArgRefType::ProfilingSettings => {
                Ok(ConcreteArg::create(config.profiling_settings))
            }
        }
    }
}

fn check_shape(
    existing: &GenericTensorAccessor,
    requested: &crate::TensorShape,
) -> Result<(), AllocatorError> {
    if existing.shape() != requested {
        return Err(AllocatorError::ShapeMismatch {
            existing: existing.shape().clone(),
            requested: requested.clone(),
        });
    }
    Ok(())
}

fn check_arg_type(slot: SlotId, spec: &OpArgSpec, value: &ConcreteArg) -> Result<(), AccessorError> {
    if spec.type_tag() != value.type_tag() {
        return Err(AccessorError::ArgType {
            slot,
            source: ArgTypeMismatch {
                expected: spec.type_tag(),
                actual: value.type_tag(),
            },
        });
    }
    Ok(())
}
