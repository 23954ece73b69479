use rustc_hash::FxHashMap;

use crate::{
    get_task_sig_impl, validate_invocation, BindingError, ComputationGraphOpAttrs, LayerGuid,
    OpTaskInvocations, OpTaskType, TaskId, TaskImplFunction, TaskInvocation, TaskSignatureAndImpl,
    ValidationError,
};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error("Invalid invocation of {task_id} for layer {layer:?}: {source}")]
    InvalidInvocation {
        layer: LayerGuid,
        task_id: TaskId,
        #[source]
        source: ValidationError,
    },
    #[error("{op} produced an invocation of {task_id}, which it does not declare")]
    UndeclaredTask { op: &'static str, task_id: TaskId },
    #[error("{task_id} is a {actual} task, but was invoked for the {expected} phase")]
    WrongPhase {
        task_id: TaskId,
        expected: OpTaskType,
        actual: OpTaskType,
    },
    #[error("{task_id} has a {kind} implementation but a {task_type} signature")]
    ImplKindMismatch {
        task_id: TaskId,
        kind: &'static str,
        task_type: OpTaskType,
    },
    #[error("Layer {0:?} is already registered")]
    DuplicateLayer(LayerGuid),
}

/// Which task runs each phase of each layer, and the signature and
/// implementation behind every task id in use.
///
/// Built once during backing setup. A layer without an entry for a phase has
/// no task for it.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    init_task_ids: FxHashMap<LayerGuid, Option<TaskId>>,
    forward_task_ids: FxHashMap<LayerGuid, Option<TaskId>>,
    backward_task_ids: FxHashMap<LayerGuid, Option<TaskId>>,
    task_mapping: FxHashMap<TaskId, TaskSignatureAndImpl>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a task kind. Re-registering an id keeps the first entry.
    pub fn register_task(
        &mut self,
        task_id: TaskId,
        sig_impl: TaskSignatureAndImpl,
    ) -> Result<(), RegistrationError> {
        let task_type = sig_impl.task_signature.task_type();
        let kind_matches = matches!(
            (&sig_impl.impl_function, task_type),
            (TaskImplFunction::Init(_), OpTaskType::Init)
                | (TaskImplFunction::FwdBwd(_), OpTaskType::Fwd | OpTaskType::Bwd)
        );
        if !kind_matches {
            return Err(RegistrationError::ImplKindMismatch {
                task_id,
                kind: sig_impl.impl_function.kind(),
                task_type,
            });
        }
        self.task_mapping.entry(task_id).or_insert(sig_impl);
        Ok(())
    }

    /// Register every task `attrs` declares and record, per phase, which task
    /// the layer runs. Each invocation the operator produces is validated
    /// against the signature of the task it names.
    pub fn register_tasks_for_layer(
        &mut self,
        layer: LayerGuid,
        attrs: &ComputationGraphOpAttrs,
    ) -> Result<(), RegistrationError> {
        if self.forward_task_ids.contains_key(&layer) {
            return Err(RegistrationError::DuplicateLayer(layer));
        }
        let task_ids = attrs.task_ids();
        for &task_id in task_ids.iter() {
            self.register_task(task_id, get_task_sig_impl(task_id))?;
        }

        let phase_task = |inv: Option<TaskInvocation>, phase: OpTaskType| {
            inv.map(|inv| self.check_invocation(layer, attrs, &inv, phase))
                .transpose()
        };
        let init = phase_task(attrs.init()?, OpTaskType::Init)?;
        let fwd = phase_task(Some(attrs.forward()?), OpTaskType::Fwd)?;
        let bwd = phase_task(Some(attrs.backward()?), OpTaskType::Bwd)?;

        log::debug!(
            "Registered {} for {:?}: init {:?}, fwd {:?}, bwd {:?}",
            attrs.name(),
            layer,
            init,
            fwd,
            bwd
        );
        self.init_task_ids.insert(layer, init);
        self.forward_task_ids.insert(layer, fwd);
        self.backward_task_ids.insert(layer, bwd);
        Ok(())
    }

    fn check_invocation(
        &self,
        layer: LayerGuid,
        attrs: &ComputationGraphOpAttrs,
        invocation: &TaskInvocation,
        phase: OpTaskType,
    ) -> Result<TaskId, RegistrationError> {
        let task_id = invocation.task_id;
        let sig_impl = self
            .task_mapping
            .get(&task_id)
            .filter(|_| attrs.task_ids().contains(&task_id))
            .ok_or(RegistrationError::UndeclaredTask {
                op: attrs.name(),
                task_id,
            })?;
        let signature = &sig_impl.task_signature;
        if signature.task_type() != phase {
            return Err(RegistrationError::WrongPhase {
                task_id,
                expected: phase,
                actual: signature.task_type(),
            });
        }
        validate_invocation(signature, invocation).map_err(|source| {
            RegistrationError::InvalidInvocation {
                layer,
                task_id,
                source,
            }
        })?;
        Ok(task_id)
    }

    pub fn task_id(&self, layer: LayerGuid, phase: OpTaskType) -> Option<TaskId> {
        let ids = match phase {
            OpTaskType::Init => &self.init_task_ids,
            OpTaskType::Fwd => &self.forward_task_ids,
            OpTaskType::Bwd => &self.backward_task_ids,
        };
        ids.get(&layer).copied().flatten()
    }

    pub fn init_task_id(&self, layer: LayerGuid) -> Option<TaskId> {
        self.task_id(layer, OpTaskType::Init)
    }

    pub fn forward_task_id(&self, layer: LayerGuid) -> Option<TaskId> {
        self.task_id(layer, OpTaskType::Fwd)
    }

    pub fn backward_task_id(&self, layer: LayerGuid) -> Option<TaskId> {
        self.task_id(layer, OpTaskType::Bwd)
    }

    pub fn signature_and_impl(&self, task_id: TaskId) -> Option<&TaskSignatureAndImpl> {
        self.task_mapping.get(&task_id)
    }

    pub fn is_registered(&self, layer: LayerGuid) -> bool {
        self.forward_task_ids.contains_key(&layer)
    }

    pub fn num_tasks(&self) -> usize {
        self.task_mapping.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        infer_bwd_signature, rvec, shape, ComputationGraph, ElementUnaryAttrs, ElementUnaryOpType,
        FlatAttrs, OpTaskSignature, ReduceAttrs, ReduceOpType, SlotId, SplitAttrs,
        TaskArgumentAccessor, TaskError, TensorShape,
    };

    fn layer_of(
        cg: &mut ComputationGraph,
        attrs: impl Into<ComputationGraphOpAttrs>,
    ) -> (LayerGuid, ComputationGraphOpAttrs) {
        let x = cg.create_input_tensor(TensorShape::f32(shape![4, 6]));
        let attrs = attrs.into();
        cg.add_layer(attrs.clone(), &[x], &[]).unwrap();
        (*cg.topological_ordering().last().unwrap(), attrs)
    }

    #[test]
    fn layer_phases_are_recorded() -> anyhow::Result<()> {
        let mut cg = ComputationGraph::new();
        let mut registry = TaskRegistry::new();
        let (unary, attrs) = layer_of(
            &mut cg,
            ElementUnaryAttrs::new(ElementUnaryOpType::Relu, None),
        );
        registry.register_tasks_for_layer(unary, &attrs)?;
        assert_eq!(registry.init_task_id(unary), Some(TaskId::ElementUnaryInit));
        assert_eq!(registry.forward_task_id(unary), Some(TaskId::ElementUnaryFwd));
        assert_eq!(registry.backward_task_id(unary), Some(TaskId::ElementUnaryBwd));
        assert_eq!(registry.num_tasks(), 3);

        let (split, attrs) = layer_of(&mut cg, SplitAttrs::new(rvec![2, 4], 1));
        registry.register_tasks_for_layer(split, &attrs)?;
        assert_eq!(registry.init_task_id(split), None);
        assert_eq!(registry.backward_task_id(split), Some(TaskId::SplitBwd));
        assert!(registry.is_registered(unary) && registry.is_registered(split));
        Ok(())
    }

    #[test]
    fn shared_task_kinds_register_once() -> anyhow::Result<()> {
        let mut cg = ComputationGraph::new();
        let mut registry = TaskRegistry::new();
        for _ in 0..3 {
            let (layer, attrs) = layer_of(
                &mut cg,
                ReduceAttrs::new(rvec![1], ReduceOpType::Mean, false),
            );
            registry.register_tasks_for_layer(layer, &attrs)?;
        }
        assert_eq!(registry.num_tasks(), 3);
        Ok(())
    }

    #[test]
    fn layers_register_once() -> anyhow::Result<()> {
        let mut cg = ComputationGraph::new();
        let mut registry = TaskRegistry::new();
        let (layer, attrs) = layer_of(&mut cg, FlatAttrs);
        registry.register_tasks_for_layer(layer, &attrs)?;
        assert_eq!(
            registry.register_tasks_for_layer(layer, &attrs),
            Err(RegistrationError::DuplicateLayer(layer))
        );
        Ok(())
    }

    fn noop(_: &TaskArgumentAccessor) -> Result<Option<f32>, TaskError> {
        Ok(None)
    }

    #[test]
    fn impl_kind_must_match_task_type() {
        let mut registry = TaskRegistry::new();
        let sig_impl = TaskSignatureAndImpl {
            name: "noop",
            impl_function: TaskImplFunction::FwdBwd(noop),
            task_signature: OpTaskSignature::new(OpTaskType::Init),
        };
        assert!(matches!(
            registry.register_task(TaskId::ElementUnaryInit, sig_impl),
            Err(RegistrationError::ImplKindMismatch { .. })
        ));
        assert!(registry.signature_and_impl(TaskId::ElementUnaryInit).is_none());
    }

    #[test]
    fn missing_required_slot_fails_registration() -> anyhow::Result<()> {
        let mut cg = ComputationGraph::new();
        let mut registry = TaskRegistry::new();
        let mut sig_impl = get_task_sig_impl(TaskId::FlatFwd);
        sig_impl.task_signature.add_arg_slot::<f32>(SlotId::new(77));
        registry.register_task(TaskId::FlatFwd, sig_impl)?;

        let (layer, attrs) = layer_of(&mut cg, FlatAttrs);
        assert_eq!(
            registry.register_tasks_for_layer(layer, &attrs),
            Err(RegistrationError::InvalidInvocation {
                layer,
                task_id: TaskId::FlatFwd,
                source: ValidationError::MissingArgSlot(SlotId::new(77)),
            })
        );
        assert!(!registry.is_registered(layer));
        Ok(())
    }

    #[test]
    fn invocation_phase_must_match_signature() -> anyhow::Result<()> {
        let mut cg = ComputationGraph::new();
        let mut registry = TaskRegistry::new();
        let fwd = get_task_sig_impl(TaskId::FlatFwd);
        registry.register_task(
            TaskId::FlatFwd,
            TaskSignatureAndImpl {
                task_signature: infer_bwd_signature(&fwd.task_signature),
                ..fwd
            },
        )?;
        let (layer, attrs) = layer_of(&mut cg, FlatAttrs);
        assert_eq!(
            registry.register_tasks_for_layer(layer, &attrs),
            Err(RegistrationError::WrongPhase {
                task_id: TaskId::FlatFwd,
                expected: OpTaskType::Fwd,
                actual: OpTaskType::Bwd,
            })
        );
        Ok(())
    }

    #[test]
    fn invocations_must_name_declared_tasks() -> anyhow::Result<()> {
        let mut cg = ComputationGraph::new();
        let mut registry = TaskRegistry::new();
        let (split, split_attrs) = layer_of(&mut cg, SplitAttrs::new(rvec![2, 4], 1));
        registry.register_tasks_for_layer(split, &split_attrs)?;
        let (flat, flat_attrs) = layer_of(&mut cg, FlatAttrs);

        let foreign = split_attrs.forward()?;
        assert_eq!(
            registry.check_invocation(flat, &flat_attrs, &foreign, OpTaskType::Fwd),
            Err(RegistrationError::UndeclaredTask {
                op: "Flat",
                task_id: TaskId::SplitFwd,
            })
        );
        Ok(())
    }
}

