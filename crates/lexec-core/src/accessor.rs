use std::sync::Arc;

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::{CPUBuffer, DType, Shape, TensorDType, TensorShape};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TensorError {
    #[error("DType mismatch, expected {expected:?}, got {actual:?}")]
    DTypeMismatch { expected: DType, actual: DType },
    #[error("Tensor accessor with {granted} permissions cannot be used as {requested}")]
    PrivilegeViolation {
        granted: Permissions,
        requested: Permissions,
    },
    #[error("Expected {expected} elements, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Access a task is granted on one tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Permissions {
    RO,
    WO,
    RW,
}

impl Permissions {
    /// Whether a holder of `self` may hand out an accessor with `requested`.
    pub fn allows(self, requested: Permissions) -> bool {
        self == Permissions::RW || self == requested
    }

    pub fn can_read(self) -> bool {
        matches!(self, Permissions::RO | Permissions::RW)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Permissions::WO | Permissions::RW)
    }
}

/// A live handle onto an allocated tensor buffer.
///
/// Cloning is cheap and aliases the same storage; the permission travels with
/// the handle and is checked on every typed read or write.
#[derive(Clone)]
pub struct GenericTensorAccessor {
    shape: TensorShape,
    storage: Arc<RwLock<CPUBuffer>>,
    permissions: Permissions,
}

impl std::fmt::Debug for GenericTensorAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericTensorAccessor")
            .field("shape", &self.shape)
            .field("permissions", &self.permissions)
            .field(
                "storage",
                &self
                    .storage
                    .try_read()
                    .map(|b| b.dump(self.shape.data_type, false)),
            )
            .finish()
    }
}

impl GenericTensorAccessor {
    pub(crate) fn new(shape: TensorShape, buffer: CPUBuffer) -> Self {
        Self {
            shape,
            storage: Arc::new(RwLock::new(buffer)),
            permissions: Permissions::RW,
        }
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn dims(&self) -> &Shape {
        &self.shape.dims
    }

    pub fn dt(&self) -> DType {
        self.shape.data_type
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Narrow this handle to `permissions`.
    pub fn restrict(&self, permissions: Permissions) -> Result<Self, TensorError> {
        if !self.permissions.allows(permissions) {
            return Err(TensorError::PrivilegeViolation {
                granted: self.permissions,
                requested: permissions,
            });
        }
        Ok(Self {
            shape: self.shape.clone(),
            storage: self.storage.clone(),
            permissions,
        })
    }

    pub fn is_same_buffer(&self, other: &GenericTensorAccessor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    fn check_dtype<T: TensorDType>(&self) -> Result<(), TensorError> {
        if T::dt() != self.dt() {
            return Err(TensorError::DTypeMismatch {
                expected: self.dt(),
                actual: T::dt(),
            });
        }
        Ok(())
    }

    pub fn read<T: TensorDType>(&self) -> Result<MappedRwLockReadGuard<'_, [T]>, TensorError> {
        if !self.permissions.can_read() {
            return Err(TensorError::PrivilegeViolation {
                granted: self.permissions,
                requested: Permissions::RO,
            });
        }
        self.check_dtype::<T>()?;
        Ok(RwLockReadGuard::map(self.storage.read(), |b| {
            b.as_slice::<T>()
        }))
    }

    pub fn write<T: TensorDType>(&self) -> Result<MappedRwLockWriteGuard<'_, [T]>, TensorError> {
        if !self.permissions.can_write() {
            return Err(TensorError::PrivilegeViolation {
                granted: self.permissions,
                requested: Permissions::WO,
            });
        }
        self.check_dtype::<T>()?;
        Ok(RwLockWriteGuard::map(self.storage.write(), |b| {
            b.as_slice_mut::<T>()
        }))
    }

    pub fn to_vec<T: TensorDType>(&self) -> Result<Vec<T>, TensorError> {
        Ok(self.read::<T>()?.to_vec())
    }

    pub fn fill<T: TensorDType>(&self, value: T) -> Result<(), TensorError> {
        self.write::<T>()?.fill(value);
        Ok(())
    }

    pub fn copy_from_slice<T: TensorDType>(&self, data: &[T]) -> Result<(), TensorError> {
        let mut dst = self.write::<T>()?;
        if dst.len() != data.len() {
            return Err(TensorError::LengthMismatch {
                expected: dst.len(),
                actual: data.len(),
            });
        }
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Zero the buffer regardless of dtype.
    pub fn zero(&self) -> Result<(), TensorError> {
        if !self.permissions.can_write() {
            return Err(TensorError::PrivilegeViolation {
                granted: self.permissions,
                requested: Permissions::WO,
            });
        }
        self.storage.write().zero();
        Ok(())
    }

    pub fn dump(&self, full: bool) -> String {
        self.storage.read().dump(self.dt(), full)
    }

    /// Raw copy of the buffer contents, for [`Self::restore`].
    pub fn snapshot(&self) -> Vec<u8> {
        self.storage.read().as_bytes().to_vec()
    }

    pub fn restore(&self, bytes: &[u8]) -> Result<(), TensorError> {
        if !self.permissions.can_write() {
            return Err(TensorError::PrivilegeViolation {
                granted: self.permissions,
                requested: Permissions::WO,
            });
        }
        let mut storage = self.storage.write();
        let dst = storage.as_bytes_mut();
        if dst.len() != bytes.len() {
            return Err(TensorError::LengthMismatch {
                expected: dst.len(),
                actual: bytes.len(),
            });
        }
        dst.copy_from_slice(bytes);
        Ok(())
    }
}
