use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use crate::{ComputationGraphOpAttrs, OpShapeInference, RVec, ShapeError, TensorShape};

slotmap::new_key_type! {
    pub struct LayerGuid;
    pub struct TensorGuid;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Tensor {0:?} does not belong to this graph")]
    UnknownTensor(TensorGuid),
    #[error("Layer {0:?} does not belong to this graph")]
    UnknownLayer(LayerGuid),
    #[error("Failed to infer output shapes of {op}: {source}")]
    Shape {
        op: &'static str,
        #[source]
        source: ShapeError,
    },
}

#[derive(Debug, Clone)]
pub struct Layer {
    pub attrs: ComputationGraphOpAttrs,
    pub inputs: RVec<TensorGuid>,
    pub weights: RVec<TensorGuid>,
    pub outputs: RVec<TensorGuid>,
}

#[derive(Debug, Clone)]
pub struct TensorAttrs {
    pub shape: TensorShape,
    /// Layer that writes this tensor, `None` for graph inputs and weights.
    pub producer: Option<LayerGuid>,
}

/// A directed acyclic graph of operator nodes connected by tensors.
///
/// Layers can only consume tensors that already exist, so the graph is
/// acyclic by construction.
#[derive(Debug, Clone, Default)]
pub struct ComputationGraph {
    layers: SlotMap<LayerGuid, Layer>,
    tensors: SlotMap<TensorGuid, TensorAttrs>,
    layer_order: Vec<LayerGuid>,
}

impl ComputationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_input_tensor(&mut self, shape: TensorShape) -> TensorGuid {
        self.tensors.insert(TensorAttrs {
            shape,
            producer: None,
        })
    }

    pub fn create_weight_tensor(&mut self, shape: TensorShape) -> TensorGuid {
        self.create_input_tensor(shape)
    }

    /// Add a node and create its output tensors.
    pub fn add_layer(
        &mut self,
        attrs: impl Into<ComputationGraphOpAttrs>,
        inputs: &[TensorGuid],
        weights: &[TensorGuid],
    ) -> Result<RVec<TensorGuid>, GraphError> {
        let attrs = attrs.into();
        let input_shapes = self.shapes_of(inputs)?;
        let weight_shapes = self.shapes_of(weights)?;
        let output_shapes = attrs
            .output_shapes(&input_shapes, &weight_shapes)
            .map_err(|source| GraphError::Shape {
                op: attrs.name(),
                source,
            })?;

        let layer = self.layers.insert(Layer {
            attrs,
            inputs: inputs.into(),
            weights: weights.into(),
            outputs: RVec::new(),
        });
        let outputs: RVec<TensorGuid> = output_shapes
            .into_iter()
            .map(|shape| {
                self.tensors.insert(TensorAttrs {
                    shape,
                    producer: Some(layer),
                })
            })
            .collect();
        self.layers[layer].outputs = outputs.clone();
        self.layer_order.push(layer);
        log::debug!(
            "Added layer {:?} ({}) with {} outputs",
            layer,
            self.layers[layer].attrs.name(),
            outputs.len()
        );
        Ok(outputs)
    }

    fn shapes_of(&self, tensors: &[TensorGuid]) -> Result<RVec<TensorShape>, GraphError> {
        tensors
            .iter()
            .map(|t| {
                self.tensors
                    .get(*t)
                    .map(|attrs| attrs.shape.clone())
                    .ok_or(GraphError::UnknownTensor(*t))
            })
            .collect()
    }

    fn layer(&self, layer: LayerGuid) -> Result<&Layer, GraphError> {
        self.layers.get(layer).ok_or(GraphError::UnknownLayer(layer))
    }

    pub fn get_layer_attrs(&self, layer: LayerGuid) -> Result<&ComputationGraphOpAttrs, GraphError> {
        Ok(&self.layer(layer)?.attrs)
    }

    pub fn get_incoming_tensors(&self, layer: LayerGuid) -> Result<&[TensorGuid], GraphError> {
        Ok(&self.layer(layer)?.inputs)
    }

    pub fn get_incoming_weights(&self, layer: LayerGuid) -> Result<&[TensorGuid], GraphError> {
        Ok(&self.layer(layer)?.weights)
    }

    pub fn get_outgoing_tensors(&self, layer: LayerGuid) -> Result<&[TensorGuid], GraphError> {
        Ok(&self.layer(layer)?.outputs)
    }

    pub fn tensor_shape(&self, tensor: TensorGuid) -> Result<&TensorShape, GraphError> {
        self.tensors
            .get(tensor)
            .map(|t| &t.shape)
            .ok_or(GraphError::UnknownTensor(tensor))
    }

    pub fn tensor_attrs(&self, tensor: TensorGuid) -> Option<&TensorAttrs> {
        self.tensors.get(tensor)
    }

    /// Layers in insertion order.
    pub fn layers(&self) -> impl Iterator<Item = LayerGuid> + '_ {
        self.layer_order.iter().copied()
    }

    pub fn tensors(&self) -> impl Iterator<Item = (TensorGuid, &TensorAttrs)> {
        self.tensors.iter()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Kahn's algorithm over producer/consumer edges. Ready layers are
    /// emitted in insertion order, so the result is deterministic.
    pub fn topological_ordering(&self) -> Vec<LayerGuid> {
        let position: FxHashMap<LayerGuid, usize> = self
            .layer_order
            .iter()
            .enumerate()
            .map(|(i, l)| (*l, i))
            .collect();

        let mut in_degree = vec![0usize; self.layer_order.len()];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); self.layer_order.len()];
        for (idx, layer) in self.layer_order.iter().enumerate() {
            let l = &self.layers[*layer];
            for t in l.inputs.iter().chain(l.weights.iter()) {
                if let Some(producer) = self.tensors.get(*t).and_then(|t| t.producer) {
                    consumers[position[&producer]].push(idx);
                    in_degree[idx] += 1;
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..in_degree.len())
            .filter(|i| in_degree[*i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.layer_order.len());
        while let Some(idx) = ready.pop_front() {
            order.push(self.layer_order[idx]);
            let mut newly_ready = vec![];
            for &c in consumers[idx].iter() {
                in_degree[c] -= 1;
                if in_degree[c] == 0 {
                    newly_ready.push(c);
                }
            }
            newly_ready.sort_unstable();
            for c in newly_ready {
                let at = ready.partition_point(|r| *r < c);
                ready.insert(at, c);
            }
        }
        order
    }

    pub fn reverse_topological_ordering(&self) -> Vec<LayerGuid> {
        let mut order = self.topological_ordering();
        order.reverse();
        order
    }
}
