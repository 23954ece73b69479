use std::any::{Any, TypeId};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{PerDeviceHandle, ProfilingSettings, TensorShape};

/// Runtime descriptor of an argument's Rust type.
#[derive(Clone, Copy)]
pub struct ArgTypeTag {
    type_id: TypeId,
    type_name: &'static str,
}

impl ArgTypeTag {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for ArgTypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ArgTypeTag {}

impl std::hash::Hash for ArgTypeTag {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl Debug for ArgTypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name)
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("Argument type mismatch, expected {expected:?}, got {actual:?}")]
pub struct ArgTypeMismatch {
    pub expected: ArgTypeTag,
    pub actual: ArgTypeTag,
}

/// Object-safe view of any value that can be captured into a binding.
pub trait ArgValue: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn dyn_eq(&self, other: &dyn ArgValue) -> bool;
}

impl<T: Any + Debug + PartialEq + Send + Sync> ArgValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn ArgValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }
}

/// A value captured by copy at binding time.
#[derive(Clone)]
pub struct ConcreteArg {
    type_tag: ArgTypeTag,
    value: Arc<dyn ArgValue>,
}

impl ConcreteArg {
    pub fn create<T: ArgValue>(value: T) -> Self {
        Self {
            type_tag: ArgTypeTag::of::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn type_tag(&self) -> ArgTypeTag {
        self.type_tag
    }

    pub fn get<T: 'static>(&self) -> Result<&T, ArgTypeMismatch> {
        self.value
            .as_ref()
            .as_any()
            .downcast_ref::<T>()
            .ok_or(ArgTypeMismatch {
                expected: ArgTypeTag::of::<T>(),
                actual: self.type_tag,
            })
    }
}

impl PartialEq for ConcreteArg {
    fn eq(&self, other: &Self) -> bool {
        self.type_tag == other.type_tag && self.value.as_ref().dyn_eq(other.value.as_ref())
    }
}

impl Debug for ConcreteArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

/// Type-erased per-device operator state, produced by init tasks.
pub type DeviceStates = ConcreteArg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpArgRefType {
    PerDeviceOpState,
    InputTensorShape(usize),
    OutputTensorShape(usize),
}

/// Forward reference to an operator-scoped value, resolved at dispatch time.
pub struct OpArgRef<T> {
    ref_type: OpArgRefType,
    _marker: PhantomData<fn() -> T>,
}

impl<T> OpArgRef<T> {
    fn new(ref_type: OpArgRefType) -> Self {
        Self {
            ref_type,
            _marker: PhantomData,
        }
    }

    pub fn ref_type(&self) -> OpArgRefType {
        self.ref_type
    }
}

impl<T> Clone for OpArgRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for OpArgRef<T> {}

impl<T> Debug for OpArgRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OpArgRef<{}>({:?})", std::any::type_name::<T>(), self.ref_type)
    }
}

/// The state this operator's init task produced on the current device.
pub fn per_device_op_state<T: 'static>() -> OpArgRef<T> {
    OpArgRef::new(OpArgRefType::PerDeviceOpState)
}

pub fn input_tensor_shape(idx: usize) -> OpArgRef<TensorShape> {
    OpArgRef::new(OpArgRefType::InputTensorShape(idx))
}

pub fn output_tensor_shape(idx: usize) -> OpArgRef<TensorShape> {
    OpArgRef::new(OpArgRefType::OutputTensorShape(idx))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeArgRefType {
    Handle,
    ProfilingSettings,
}

/// Reference to session-global state such as the device handle.
pub struct RuntimeArgRef<T> {
    ref_type: RuntimeArgRefType,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RuntimeArgRef<T> {
    fn new(ref_type: RuntimeArgRefType) -> Self {
        Self {
            ref_type,
            _marker: PhantomData,
        }
    }

    pub fn ref_type(&self) -> RuntimeArgRefType {
        self.ref_type
    }
}

impl<T> Clone for RuntimeArgRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RuntimeArgRef<T> {}

impl<T> Debug for RuntimeArgRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RuntimeArgRef<{}>({:?})",
            std::any::type_name::<T>(),
            self.ref_type
        )
    }
}

pub fn device_handle() -> RuntimeArgRef<PerDeviceHandle> {
    RuntimeArgRef::new(RuntimeArgRefType::Handle)
}

pub fn profiling_settings() -> RuntimeArgRef<ProfilingSettings> {
    RuntimeArgRef::new(RuntimeArgRefType::ProfilingSettings)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpArgRefSpec {
    pub type_tag: ArgTypeTag,
    pub ref_type: OpArgRefType,
}

impl OpArgRefSpec {
    pub fn create<T: 'static>(arg_ref: OpArgRef<T>) -> Self {
        Self {
            type_tag: ArgTypeTag::of::<T>(),
            ref_type: arg_ref.ref_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeArgRefSpec {
    pub type_tag: ArgTypeTag,
    pub ref_type: RuntimeArgRefType,
}

impl RuntimeArgRefSpec {
    pub fn create<T: 'static>(arg_ref: RuntimeArgRef<T>) -> Self {
        Self {
            type_tag: ArgTypeTag::of::<T>(),
            ref_type: arg_ref.ref_type,
        }
    }
}

/// Where a bound argument's value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum OpArgSpec {
    Concrete(ConcreteArg),
    OpRef(OpArgRefSpec),
    RuntimeRef(RuntimeArgRefSpec),
}

impl OpArgSpec {
    pub fn type_tag(&self) -> ArgTypeTag {
        match self {
            OpArgSpec::Concrete(c) => c.type_tag(),
            OpArgSpec::OpRef(r) => r.type_tag,
            OpArgSpec::RuntimeRef(r) => r.type_tag,
        }
    }
}
