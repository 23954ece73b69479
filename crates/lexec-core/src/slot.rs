#[cfg(test)]
use test_strategy::Arbitrary;

/// Names one tensor or argument of a task. Slot ids are scoped to a single
/// operator kind and shared by all of its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);

impl SlotId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IsGrad {
    Yes,
    No,
}

impl IsGrad {
    pub fn is_grad(self) -> bool {
        matches!(self, IsGrad::Yes)
    }
}

#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum TensorRole {
    Input,
    Weight,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum SlotType {
    Tensor,
    Variadic,
}

#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OpSlotOptions {
    Optional,
    Untrainable,
    OptionalUntrainable,
    #[default]
    Necessary,
}

impl OpSlotOptions {
    pub fn is_optional(self) -> bool {
        matches!(
            self,
            OpSlotOptions::Optional | OpSlotOptions::OptionalUntrainable
        )
    }

    pub fn is_trainable(self) -> bool {
        matches!(self, OpSlotOptions::Optional | OpSlotOptions::Necessary)
    }
}

/// Which of the operator's tensors of a given role a slot refers to.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorSelector {
    Index(#[cfg_attr(test, strategy(0..4usize))] usize),
    All,
}

/// Identifies a tensor of the owning operator by role and position, never a
/// concrete buffer.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_new::new)]
pub struct OpTensorSpec {
    pub role: TensorRole,
    pub slot_option: OpSlotOptions,
    pub selector: TensorSelector,
}

impl OpTensorSpec {
    /// Every tensor of `role`, bound to a variadic slot.
    pub fn all(role: TensorRole) -> Self {
        Self::new(role, OpSlotOptions::Necessary, TensorSelector::All)
    }

    pub fn slot_type(&self) -> SlotType {
        match self.selector {
            TensorSelector::Index(_) => SlotType::Tensor,
            TensorSelector::All => SlotType::Variadic,
        }
    }
}

pub fn input_tensor(idx: usize) -> OpTensorSpec {
    OpTensorSpec::new(
        TensorRole::Input,
        OpSlotOptions::Necessary,
        TensorSelector::Index(idx),
    )
}

pub fn output_tensor(idx: usize) -> OpTensorSpec {
    OpTensorSpec::new(
        TensorRole::Output,
        OpSlotOptions::Necessary,
        TensorSelector::Index(idx),
    )
}

pub fn weight_tensor(idx: usize) -> OpTensorSpec {
    OpTensorSpec::new(
        TensorRole::Weight,
        OpSlotOptions::Necessary,
        TensorSelector::Index(idx),
    )
}
