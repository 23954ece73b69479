use std::sync::Arc;

use crate::{
    AccessorError, Allocator, AllocatorError, ArgTypeTag, BindingError, ComputationGraph,
    DeviceError, DeviceSpecific, DeviceStates, GenericTensorAccessor, GraphError, IsGrad,
    LayerGuid, LocalSlotsBacking, OpTaskInvocations, OpTaskSignature, OpTaskType,
    RegistrationError, RuntimeArgConfig, TaskArgumentAccessor, TaskError, TaskId,
    TaskImplFunction, TaskInvocation, TaskRegistry, TensorBackingMap, TensorError, TensorGuid,
};

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    Accessor(#[from] AccessorError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("Task {task_id} failed on layer {layer:?}: {source}")]
    Task {
        task_id: TaskId,
        layer: LayerGuid,
        #[source]
        source: TaskError,
    },
    #[error("Layer {layer:?} has no registered {phase} task")]
    UnregisteredPhase { layer: LayerGuid, phase: OpTaskType },
    #[error("No implementation registered for {0}")]
    MissingImplementation(TaskId),
    #[error("{task_id} does not have an implementation usable for the {phase} phase")]
    WrongImplementationKind { task_id: TaskId, phase: OpTaskType },
    #[error("{task_id} returned {actual:?}, its signature declares {expected:?}")]
    ReturnTypeMismatch {
        task_id: TaskId,
        expected: ArgTypeTag,
        actual: ArgTypeTag,
    },
    #[error("The {0} pass is not implemented")]
    NotImplemented(&'static str),
}

/// Layers visited by one pass, in dispatch order, with the elapsed time each
/// task reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassTrace {
    entries: Vec<(LayerGuid, Option<f32>)>,
}

impl PassTrace {
    fn push(&mut self, layer: LayerGuid, elapsed_ms: Option<f32>) {
        self.entries.push((layer, elapsed_ms));
    }

    pub fn entries(&self) -> &[(LayerGuid, Option<f32>)] {
        &self.entries
    }

    pub fn layers(&self) -> impl Iterator<Item = LayerGuid> + '_ {
        self.entries.iter().map(|(l, _)| *l)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of every reported time, `None` if no task was profiled.
    pub fn total_elapsed_ms(&self) -> Option<f32> {
        self.entries
            .iter()
            .filter_map(|(_, t)| *t)
            .fold(None, |acc, t| Some(acc.unwrap_or(0.0) + t))
    }
}

/// # LocalTrainingBacking
///
/// Owns everything needed to run a computation graph on one device: the
/// graph, its tensor and gradient buffers, the task registry and per-layer
/// operator state.
///
/// Construction registers every layer's tasks and allocates every tensor the
/// graph mentions exactly once. Forward dispatch follows one fixed
/// topological order and backward dispatch its exact reverse.
#[derive(Debug)]
pub struct LocalTrainingBacking {
    computation_graph: ComputationGraph,
    task_registry: TaskRegistry,
    local_slots_backing: LocalSlotsBacking,
    topological_ordering: Vec<LayerGuid>,
}

impl LocalTrainingBacking {
    pub fn new(
        allocator: Arc<dyn Allocator>,
        computation_graph: ComputationGraph,
        allocated_tensors: TensorBackingMap,
        runtime_arg_config: RuntimeArgConfig,
    ) -> Result<Self, ExecutionError> {
        Self::with_task_registry(
            allocator,
            computation_graph,
            allocated_tensors,
            runtime_arg_config,
            TaskRegistry::new(),
        )
    }

    /// Like [`Self::new`], starting from `task_registry`. Task kinds already
    /// registered there take precedence over the built-in catalogue.
    pub fn with_task_registry(
        allocator: Arc<dyn Allocator>,
        computation_graph: ComputationGraph,
        allocated_tensors: TensorBackingMap,
        runtime_arg_config: RuntimeArgConfig,
        mut task_registry: TaskRegistry,
    ) -> Result<Self, ExecutionError> {
        for (&tensor, backing) in allocated_tensors.iter() {
            let shape = computation_graph.tensor_shape(tensor)?;
            if backing.shape() != shape {
                return Err(AllocatorError::ShapeMismatch {
                    existing: backing.shape().clone(),
                    requested: shape.clone(),
                }
                .into());
            }
        }
        let n_preallocated = allocated_tensors.len();
        let mut local_slots_backing = LocalSlotsBacking::new(allocated_tensors, runtime_arg_config);
        let topological_ordering = computation_graph.topological_ordering();

        for &layer in topological_ordering.iter() {
            let attrs = computation_graph.get_layer_attrs(layer)?;
            task_registry.register_tasks_for_layer(layer, attrs)?;

            let inputs = computation_graph.get_incoming_tensors(layer)?;
            let weights = computation_graph.get_incoming_weights(layer)?;
            let outputs = computation_graph.get_outgoing_tensors(layer)?;
            for &tensor in inputs.iter().chain(weights.iter()) {
                if !local_slots_backing.is_allocated(tensor, IsGrad::No) {
                    log::warn!(
                        "Tensor {:?} consumed by {:?} has no backing, allocating zeroed",
                        tensor,
                        layer
                    );
                }
            }
            for &tensor in inputs.iter().chain(weights.iter()).chain(outputs.iter()) {
                let shape = computation_graph.tensor_shape(tensor)?;
                for is_grad in [IsGrad::No, IsGrad::Yes] {
                    if !local_slots_backing.is_allocated(tensor, is_grad) {
                        local_slots_backing.insert_backing(
                            tensor,
                            is_grad,
                            allocator.allocate_tensor(shape)?,
                        )?;
                    }
                }
            }
            local_slots_backing.set_layer_tensors(layer, inputs, weights, outputs);
        }

        log::info!(
            "Backing ready: {} layers, {} tasks, {} tensors ({} pre-allocated)",
            topological_ordering.len(),
            task_registry.num_tasks(),
            local_slots_backing.tensor_backings().len(),
            n_preallocated
        );
        Ok(Self {
            computation_graph,
            task_registry,
            local_slots_backing,
            topological_ordering,
        })
    }

    /// Run every layer's init task and keep the state it returns. Layers
    /// without an init task are skipped.
    pub fn execute_init(&mut self) -> Result<PassTrace, ExecutionError> {
        let mut trace = PassTrace::default();
        for layer in self.topological_ordering.clone() {
            let Some(task_id) = self.task_registry.init_task_id(layer) else {
                continue;
            };
            let invocation = self
                .computation_graph
                .get_layer_attrs(layer)?
                .init()?
                .ok_or(ExecutionError::UnregisteredPhase {
                    layer,
                    phase: OpTaskType::Init,
                })?;
            let state = self.call_init_task(layer, task_id, &invocation)?;
            self.local_slots_backing.add_per_device_op_state(layer, state);
            trace.push(layer, None);
        }
        Ok(trace)
    }

    pub fn execute_forward(&self) -> Result<PassTrace, ExecutionError> {
        self.execute_pass(OpTaskType::Fwd, self.topological_ordering.iter().copied())
    }

    pub fn execute_backward(&self) -> Result<PassTrace, ExecutionError> {
        self.execute_pass(OpTaskType::Bwd, self.topological_ordering.iter().rev().copied())
    }

    /// Optimizer updates are layered on top of this backing.
    pub fn execute_update(&mut self) -> Result<(), ExecutionError> {
        Err(ExecutionError::NotImplemented("update"))
    }

    fn execute_pass(
        &self,
        phase: OpTaskType,
        order: impl Iterator<Item = LayerGuid>,
    ) -> Result<PassTrace, ExecutionError> {
        let mut trace = PassTrace::default();
        for layer in order {
            let task_id = self
                .task_registry
                .task_id(layer, phase)
                .ok_or(ExecutionError::UnregisteredPhase { layer, phase })?;
            let attrs = self.computation_graph.get_layer_attrs(layer)?;
            let invocation = match phase {
                OpTaskType::Fwd => attrs.forward()?,
                _ => attrs.backward()?,
            };
            let elapsed = self.call_fwd_bwd_task(layer, task_id, phase, &invocation)?;
            trace.push(layer, elapsed);
        }
        Ok(trace)
    }

    fn signature_and_impl(
        &self,
        task_id: TaskId,
    ) -> Result<(&OpTaskSignature, TaskImplFunction), ExecutionError> {
        let sig_impl = self
            .task_registry
            .signature_and_impl(task_id)
            .ok_or(ExecutionError::MissingImplementation(task_id))?;
        Ok((&sig_impl.task_signature, sig_impl.impl_function))
    }

    fn construct_task_argument_accessor(
        &self,
        layer: LayerGuid,
        invocation: &TaskInvocation,
        signature: &OpTaskSignature,
    ) -> Result<TaskArgumentAccessor, ExecutionError> {
        let binding = &invocation.binding;
        let tensor_slots = self
            .local_slots_backing
            .construct_tensor_slots_backing(binding, layer, signature)?;
        let arg_slots = self
            .local_slots_backing
            .construct_arg_slots_backing(binding, layer)?;
        let acc = TaskArgumentAccessor::new(
            tensor_slots,
            arg_slots,
            self.local_slots_backing.device_idx(),
        );
        #[cfg(feature = "debug")]
        log::trace!("Resolved {} for {:?}: {:?}", invocation.task_id, layer, acc);
        Ok(acc)
    }

    fn call_init_task(
        &self,
        layer: LayerGuid,
        task_id: TaskId,
        invocation: &TaskInvocation,
    ) -> Result<DeviceSpecific<DeviceStates>, ExecutionError> {
        let (signature, impl_function) = self.signature_and_impl(task_id)?;
        let TaskImplFunction::Init(task) = impl_function else {
            return Err(ExecutionError::WrongImplementationKind {
                task_id,
                phase: OpTaskType::Init,
            });
        };
        let acc = self.construct_task_argument_accessor(layer, invocation, signature)?;
        log::debug!("init {:?}: {}", layer, task_id);
        let state = task(&acc).map_err(|source| ExecutionError::Task {
            task_id,
            layer,
            source,
        })?;

        let returned = state.get(self.local_slots_backing.device_idx())?.type_tag();
        if let Some(expected) = signature.return_value() {
            if expected != returned {
                return Err(ExecutionError::ReturnTypeMismatch {
                    task_id,
                    expected,
                    actual: returned,
                });
            }
        }
        Ok(state)
    }

    fn call_fwd_bwd_task(
        &self,
        layer: LayerGuid,
        task_id: TaskId,
        phase: OpTaskType,
        invocation: &TaskInvocation,
    ) -> Result<Option<f32>, ExecutionError> {
        let (signature, impl_function) = self.signature_and_impl(task_id)?;
        let TaskImplFunction::FwdBwd(task) = impl_function else {
            return Err(ExecutionError::WrongImplementationKind { task_id, phase });
        };
        let acc = self.construct_task_argument_accessor(layer, invocation, signature)?;
        log::debug!("{} {:?}: {}", phase, layer, task_id);
        task(&acc).map_err(|source| ExecutionError::Task {
            task_id,
            layer,
            source,
        })
    }

    /// Clear every gradient buffer. Backward tasks accumulate, so this runs
    /// between training iterations.
    pub fn zero_gradients(&self) -> Result<(), ExecutionError> {
        for grad in self.local_slots_backing.gradient_backings().values() {
            grad.zero()?;
        }
        Ok(())
    }

    pub fn tensor_backing(&self, tensor: TensorGuid) -> Option<&GenericTensorAccessor> {
        self.local_slots_backing.get_backing(tensor, IsGrad::No)
    }

    pub fn gradient_tensor_backing(&self, tensor: TensorGuid) -> Option<&GenericTensorAccessor> {
        self.local_slots_backing.get_backing(tensor, IsGrad::Yes)
    }

    pub fn per_device_op_state(&self, layer: LayerGuid) -> Option<&DeviceSpecific<DeviceStates>> {
        self.local_slots_backing.per_device_op_state(layer)
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.task_registry
    }

    pub fn computation_graph(&self) -> &ComputationGraph {
        &self.computation_graph
    }

    pub fn topological_ordering(&self) -> &[LayerGuid] {
        &self.topological_ordering
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        get_local_memory_allocator, get_task_sig_impl, rvec, shape, weight_tensor, ConcreteArg,
        ElementUnaryAttrs, ElementUnaryOpType, LinearAttrs, LocalCpuAllocator, Permissions,
        ReduceAttrs, ReduceOpType, TaskSignatureAndImpl, TensorRole, TensorShape,
        TensorSlotBacking,
    };

    fn relu_graph() -> anyhow::Result<(ComputationGraph, TensorGuid, TensorGuid)> {
        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![2, 3]));
        let y = cg.add_layer(
            ElementUnaryAttrs::new(ElementUnaryOpType::Relu, None),
            &[x],
            &[],
        )?;
        Ok((cg, x, y[0]))
    }

    #[test]
    fn update_is_not_implemented() -> anyhow::Result<()> {
        let (cg, _, _) = relu_graph()?;
        let mut backing = LocalTrainingBacking::new(
            get_local_memory_allocator(),
            cg,
            TensorBackingMap::default(),
            RuntimeArgConfig::default(),
        )?;
        assert!(matches!(
            backing.execute_update(),
            Err(ExecutionError::NotImplemented("update"))
        ));
        Ok(())
    }

    #[test]
    fn preallocated_shape_must_match() -> anyhow::Result<()> {
        let (cg, x, _) = relu_graph()?;
        let allocator = get_local_memory_allocator();
        let mut allocated = TensorBackingMap::default();
        allocated.insert(x, allocator.allocate_tensor(&TensorShape::f32(shape![3, 2]))?);
        let result = LocalTrainingBacking::new(
            allocator,
            cg,
            allocated,
            RuntimeArgConfig::default(),
        );
        assert!(matches!(
            result,
            Err(ExecutionError::Allocator(AllocatorError::ShapeMismatch { .. }))
        ));
        Ok(())
    }

    #[test]
    fn forward_before_init_is_rejected() -> anyhow::Result<()> {
        let (cg, _, _) = relu_graph()?;
        let backing = LocalTrainingBacking::new(
            get_local_memory_allocator(),
            cg,
            TensorBackingMap::default(),
            RuntimeArgConfig::default(),
        )?;
        assert!(matches!(
            backing.execute_forward(),
            Err(ExecutionError::Accessor(AccessorError::MissingPerDeviceState(_)))
        ));
        Ok(())
    }

    #[test]
    fn init_stores_typed_state() -> anyhow::Result<()> {
        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![4, 2]));
        cg.add_layer(ReduceAttrs::new(rvec![0], ReduceOpType::Sum, false), &[x], &[])?;
        let allocator = Arc::new(LocalCpuAllocator::default());
        let mut backing = LocalTrainingBacking::new(
            allocator.clone(),
            cg,
            TensorBackingMap::default(),
            RuntimeArgConfig::default(),
        )?;
        // x, the reduced output and both gradients
        assert_eq!(allocator.n_allocations(), 4);

        let trace = backing.execute_init()?;
        let layer = backing.topological_ordering()[0];
        assert_eq!(trace.layers().collect::<Vec<_>>(), vec![layer]);
        let state = backing.per_device_op_state(layer).unwrap();
        let state = state.get(0)?.get::<crate::ReducePerDeviceState>()?;
        assert_eq!(state.reduction_size, 4);
        Ok(())
    }

    fn wrong_state(acc: &TaskArgumentAccessor) -> Result<DeviceSpecific<DeviceStates>, TaskError> {
        Ok(DeviceSpecific::create(
            acc.device_idx(),
            ConcreteArg::create(7usize),
        ))
    }

    #[test]
    fn init_return_type_is_checked() -> anyhow::Result<()> {
        let (cg, _, _) = relu_graph()?;
        let mut registry = TaskRegistry::new();
        registry.register_task(
            TaskId::ElementUnaryInit,
            TaskSignatureAndImpl {
                impl_function: TaskImplFunction::Init(wrong_state),
                ..get_task_sig_impl(TaskId::ElementUnaryInit)
            },
        )?;
        let mut backing = LocalTrainingBacking::with_task_registry(
            get_local_memory_allocator(),
            cg,
            TensorBackingMap::default(),
            RuntimeArgConfig::default(),
            registry,
        )?;
        let layer = backing.topological_ordering()[0];
        assert!(matches!(
            backing.execute_init(),
            Err(ExecutionError::ReturnTypeMismatch {
                task_id: TaskId::ElementUnaryInit,
                ..
            })
        ));
        assert!(backing.per_device_op_state(layer).is_none());
        Ok(())
    }

    #[test]
    fn dispatch_checks_implementation() -> anyhow::Result<()> {
        let (cg, _, _) = relu_graph()?;
        let backing = LocalTrainingBacking::new(
            get_local_memory_allocator(),
            cg,
            TensorBackingMap::default(),
            RuntimeArgConfig::default(),
        )?;
        let layer = backing.topological_ordering()[0];
        let attrs = backing.computation_graph().get_layer_attrs(layer)?;
        let fwd = attrs.forward()?;
        let init = attrs.init()?.unwrap();

        assert!(matches!(
            backing.call_fwd_bwd_task(layer, TaskId::ElementUnaryInit, OpTaskType::Fwd, &fwd),
            Err(ExecutionError::WrongImplementationKind {
                task_id: TaskId::ElementUnaryInit,
                phase: OpTaskType::Fwd
            })
        ));
        assert!(matches!(
            backing.call_init_task(layer, TaskId::ElementUnaryFwd, &init),
            Err(ExecutionError::WrongImplementationKind {
                phase: OpTaskType::Init,
                ..
            })
        ));
        // No Flat layer, so its tasks were never registered.
        assert!(matches!(
            backing.call_fwd_bwd_task(layer, TaskId::FlatFwd, OpTaskType::Fwd, &fwd),
            Err(ExecutionError::MissingImplementation(TaskId::FlatFwd))
        ));
        Ok(())
    }

    #[test]
    fn weights_resolve_with_accumulated_gradients() -> anyhow::Result<()> {
        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![2, 3]));
        let w = cg.create_weight_tensor(TensorShape::f32(shape![3, 4]));
        cg.add_layer(LinearAttrs::new(4), &[x], &[w])?;
        let allocator = Arc::new(LocalCpuAllocator::default());
        let backing = LocalTrainingBacking::new(
            allocator.clone(),
            cg,
            TensorBackingMap::default(),
            RuntimeArgConfig::default(),
        )?;
        // x, w, the projection and their gradients
        assert_eq!(allocator.n_allocations(), 6);

        let layer = backing.topological_ordering()[0];
        let slots = &backing.local_slots_backing;
        assert_eq!(slots.layer_tensors(layer, TensorRole::Weight)?, &[w]);
        let w_primal = backing.tensor_backing(w).unwrap();
        let w_grad = backing.gradient_tensor_backing(w).unwrap();
        assert!(!w_primal.is_same_buffer(w_grad));

        let bwd = backing.computation_graph().get_layer_attrs(layer)?.backward()?;
        let (signature, _) = backing.signature_and_impl(bwd.task_id)?;
        let resolved = slots.construct_tensor_slots_backing(&bwd.binding, layer, signature)?;
        let weight = |is_grad| {
            let (key, _) = bwd
                .binding
                .tensor_bindings()
                .iter()
                .find(|((_, g), spec)| *g == is_grad && **spec == weight_tensor(0))
                .unwrap();
            match &resolved[key] {
                TensorSlotBacking::Single(t) => t.clone(),
                TensorSlotBacking::Variadic(_) => unreachable!(),
            }
        };
        assert_eq!(weight(IsGrad::Yes).permissions(), Permissions::RW);
        assert!(weight(IsGrad::Yes).is_same_buffer(w_grad));
        assert_eq!(weight(IsGrad::No).permissions(), Permissions::RO);
        assert!(weight(IsGrad::No).is_same_buffer(w_primal));
        Ok(())
    }
}
