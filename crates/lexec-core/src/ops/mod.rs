mod combine;
mod element_unary;
mod flat;
mod linear;
mod reduce;
mod reduction;
mod replicate;
mod split;

pub use combine::CombineAttrs;
pub use element_unary::{ElementUnaryAttrs, ElementUnaryOpType, ElementUnaryPerDeviceState};
pub use flat::FlatAttrs;
pub use linear::LinearAttrs;
pub use reduce::{ReduceAttrs, ReduceOpType, ReducePerDeviceState};
pub use reduction::ReductionAttrs;
pub use replicate::ReplicateAttrs;
pub use split::SplitAttrs;

use crate::{TaskId, TaskSignatureAndImpl};

/// The catalogue of every task the runtime can dispatch.
pub fn get_task_sig_impl(task_id: TaskId) -> TaskSignatureAndImpl {
    match task_id {
        TaskId::ElementUnaryInit => element_unary::init_task_sig_impl(),
        TaskId::ElementUnaryFwd => element_unary::fwd_task_sig_impl(),
        TaskId::ElementUnaryBwd => element_unary::bwd_task_sig_impl(),
        TaskId::SplitFwd => split::fwd_task_sig_impl(),
        TaskId::SplitBwd => split::bwd_task_sig_impl(),
        TaskId::ReduceInit => reduce::init_task_sig_impl(),
        TaskId::ReduceFwd => reduce::fwd_task_sig_impl(),
        TaskId::ReduceBwd => reduce::bwd_task_sig_impl(),
        TaskId::ReductionFwd => reduction::fwd_task_sig_impl(),
        TaskId::ReductionBwd => reduction::bwd_task_sig_impl(),
        TaskId::ReplicateFwd => replicate::fwd_task_sig_impl(),
        TaskId::ReplicateBwd => replicate::bwd_task_sig_impl(),
        TaskId::CombineFwd => combine::fwd_task_sig_impl(),
        TaskId::CombineBwd => combine::bwd_task_sig_impl(),
        TaskId::FlatFwd => flat::fwd_task_sig_impl(),
        TaskId::FlatBwd => flat::bwd_task_sig_impl(),
        TaskId::LinearFwd => linear::fwd_task_sig_impl(),
        TaskId::LinearBwd => linear::bwd_task_sig_impl(),
    }
}
