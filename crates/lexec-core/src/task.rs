use crate::{
    AccessorError, DeviceError, DeviceSpecific, DeviceStates, OpTaskSignature, ShapeError,
    TaskArgumentAccessor, TensorError,
};

/// Every task the runtime knows how to run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum_macros::Display,
    strum_macros::EnumIter,
    strum_macros::IntoStaticStr,
)]
pub enum TaskId {
    ElementUnaryInit,
    ElementUnaryFwd,
    ElementUnaryBwd,
    SplitFwd,
    SplitBwd,
    ReduceInit,
    ReduceFwd,
    ReduceBwd,
    ReductionFwd,
    ReductionBwd,
    ReplicateFwd,
    ReplicateBwd,
    CombineFwd,
    CombineBwd,
    FlatFwd,
    FlatBwd,
    LinearFwd,
    LinearBwd,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Accessor(#[from] AccessorError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

pub type InitTaskImplFn =
    fn(&TaskArgumentAccessor) -> Result<DeviceSpecific<DeviceStates>, TaskError>;

/// Returns the measured elapsed time in milliseconds when profiling is
/// enabled.
pub type FwdBwdTaskImplFn = fn(&TaskArgumentAccessor) -> Result<Option<f32>, TaskError>;

#[derive(Clone, Copy)]
pub enum TaskImplFunction {
    Init(InitTaskImplFn),
    FwdBwd(FwdBwdTaskImplFn),
}

impl TaskImplFunction {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskImplFunction::Init(_) => "init",
            TaskImplFunction::FwdBwd(_) => "fwd/bwd",
        }
    }
}

impl std::fmt::Debug for TaskImplFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskImplFunction::{}", self.kind())
    }
}

#[derive(Debug, Clone)]
pub struct TaskSignatureAndImpl {
    pub name: &'static str,
    pub impl_function: TaskImplFunction,
    pub task_signature: OpTaskSignature,
}
