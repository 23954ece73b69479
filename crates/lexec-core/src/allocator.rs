use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{CPUBuffer, GenericTensorAccessor, TensorShape};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("Invalid buffer layout: size {size}, alignment {alignment}")]
    InvalidLayout { size: usize, alignment: usize },
    #[error("Tensor already allocated as {existing:?}, cannot re-allocate as {requested:?}")]
    ShapeMismatch {
        existing: TensorShape,
        requested: TensorShape,
    },
}

/// Capability for obtaining tensor buffers.
///
/// Implementations are not expected to deduplicate; the execution backing
/// guarantees each tensor identity is allocated at most once.
pub trait Allocator: std::fmt::Debug {
    fn allocate(&self, shape: &TensorShape) -> Result<CPUBuffer, AllocatorError>;

    fn allocate_tensor(&self, shape: &TensorShape) -> Result<GenericTensorAccessor, AllocatorError> {
        Ok(GenericTensorAccessor::new(
            shape.clone(),
            self.allocate(shape)?,
        ))
    }
}

/// Host memory allocator, hands out zero-initialised buffers.
#[derive(Debug, Default)]
pub struct LocalCpuAllocator {
    n_allocations: AtomicUsize,
    n_bytes: AtomicUsize,
}

impl LocalCpuAllocator {
    pub fn n_allocations(&self) -> usize {
        self.n_allocations.load(Ordering::Relaxed)
    }

    pub fn n_bytes(&self) -> usize {
        self.n_bytes.load(Ordering::Relaxed)
    }
}

impl Allocator for LocalCpuAllocator {
    fn allocate(&self, shape: &TensorShape) -> Result<CPUBuffer, AllocatorError> {
        let buffer = CPUBuffer::zeros(shape.num_bytes(), shape.data_type)?;
        self.n_allocations.fetch_add(1, Ordering::Relaxed);
        self.n_bytes.fetch_add(shape.num_bytes(), Ordering::Relaxed);
        log::trace!("Allocated {:?} ({} bytes)", shape, shape.num_bytes());
        Ok(buffer)
    }
}

pub fn get_local_memory_allocator() -> Arc<LocalCpuAllocator> {
    Arc::new(LocalCpuAllocator::default())
}
