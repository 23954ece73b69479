mod accessor;
mod allocator;
mod arg;
mod backing;
mod binding;
mod config;
mod cpu;
mod device;
mod dtype;
mod graph;
mod op;
mod ops;
mod profiling;
mod registry;
mod shape;
mod signature;
mod slot;
mod slots_backing;
mod storage;
mod task;
mod task_accessor;

pub use accessor::*;
pub use allocator::*;
pub use arg::*;
pub use backing::*;
pub use binding::*;
pub use config::*;
pub use device::*;
pub use dtype::*;
pub use graph::*;
pub use op::*;
pub use ops::*;
pub use profiling::*;
pub use registry::*;
pub use shape::*;
pub use signature::*;
pub use slot::*;
pub use slots_backing::*;
pub use storage::*;
pub use task::*;
pub use task_accessor::*;

use smallvec::SmallVec;
pub type RVec<T> = SmallVec<[T; 4]>;

//https://github.com/sonos/tract/blob/main/data/src/macros.rs#L2
#[macro_export]
macro_rules! rvec {
    (@one $x:expr) => (1usize);
    ($elem:expr; $n:expr) => ({
        $crate::RVec::from_elem($elem, $n)
    });
    ($($x:expr),*$(,)*) => ({
        let count = 0usize $(+ rvec![@one $x])*;
        #[allow(unused_mut)]
        let mut vec = $crate::RVec::new();
        if count <= vec.inline_size() {
            $(vec.push($x);)*
            vec
        } else {
            $crate::RVec::from_vec(vec![$($x,)*])
        }
    });
}

#[macro_export]
macro_rules! shape {
    ($($x:expr),*$(,)*) => ({
        use $crate::rvec;
        $crate::Shape::new(rvec![$($x,)*])
    });
}

pub mod prelude {
    pub use crate::{
        rvec, shape, ComputationGraph, LocalTrainingBacking, RuntimeArgConfig, TensorShape,
    };
}
