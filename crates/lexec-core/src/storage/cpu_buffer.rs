use bytemuck::NoUninit;

use crate::{AllocatorError, DType, TensorDType};

use std::{alloc::Layout, fmt::Debug};

#[derive(derive_new::new, Debug, PartialEq, Eq)]
pub struct RawCPUBuffer(*mut u8, Layout);

impl RawCPUBuffer {
    pub fn into_raw_parts(&self) -> (*mut u8, Layout) {
        (self.0, self.1)
    }

    pub fn n_bytes(&self) -> usize {
        self.1.size()
    }

    pub fn as_bytes(&self) -> &[u8] {
        if self.0.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.0, self.1.size()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        if self.0.is_null() {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.0, self.1.size()) }
    }

    pub fn zeroed(size: usize, alignment: usize) -> Result<Self, AllocatorError> {
        let layout = Layout::from_size_align(size, alignment)
            .map_err(|_| AllocatorError::InvalidLayout { size, alignment })?;
        let data = if size == 0 {
            std::ptr::null_mut()
        } else {
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            ptr
        };
        Ok(Self(data, layout))
    }
}

impl Clone for RawCPUBuffer {
    fn clone(&self) -> Self {
        let (ptr, layout) = self.into_raw_parts();
        let data = if layout.size() == 0 {
            std::ptr::null_mut()
        } else {
            let data = unsafe { std::alloc::alloc(layout) };
            if data.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            unsafe { ptr.copy_to_nonoverlapping(data, layout.size()) };
            data
        };
        Self(data, layout)
    }
}

impl Drop for RawCPUBuffer {
    fn drop(&mut self) {
        if !self.0.is_null() && self.1.size() > 0 {
            unsafe { std::alloc::dealloc(self.0, self.1) }
        }
    }
}

/// Managed host buffer backing one graph tensor (or its gradient).
#[derive(Debug, Clone)]
pub struct CPUBuffer {
    inner: RawCPUBuffer,
}

unsafe impl Send for CPUBuffer {}
unsafe impl Sync for CPUBuffer {}

impl CPUBuffer {
    pub fn zeros(n_bytes: usize, dt: DType) -> Result<Self, AllocatorError> {
        Ok(Self::from(RawCPUBuffer::zeroed(n_bytes, dt.alignment())?))
    }

    pub fn from_slice<T: NoUninit>(data: &[T]) -> Result<Self, AllocatorError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut raw = RawCPUBuffer::zeroed(bytes.len(), std::mem::align_of::<T>())?;
        raw.as_bytes_mut().copy_from_slice(bytes);
        Ok(Self::from(raw))
    }

    pub fn inner(&self) -> &RawCPUBuffer {
        &self.inner
    }

    pub fn n_bytes(&self) -> usize {
        self.inner.n_bytes()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.inner.as_bytes_mut()
    }

    pub fn as_slice<T: TensorDType>(&self) -> &[T] {
        if self.n_bytes() == 0 {
            return &[];
        }
        bytemuck::cast_slice(self.inner.as_bytes())
    }

    pub fn as_slice_mut<T: TensorDType>(&mut self) -> &mut [T] {
        if self.n_bytes() == 0 {
            return &mut [];
        }
        bytemuck::cast_slice_mut(self.inner.as_bytes_mut())
    }

    pub fn fill<T: TensorDType>(&mut self, value: T) {
        self.as_slice_mut::<T>().fill(value);
    }

    pub fn zero(&mut self) {
        self.inner.as_bytes_mut().fill(0);
    }

    pub fn dump(&self, dtype: DType, full: bool) -> String {
        fn dump_inner<T: TensorDType>(data: &[T], full: bool) -> String {
            let length = if data.len() < 64 { data.len() } else { 64 };
            if full {
                format!("{:?}", data)
            } else {
                format!("{:?}...{:?}", &data[..length], &data[data.len() - length..])
            }
        }
        match dtype {
            DType::F32 => dump_inner(self.as_slice::<f32>(), full),
            DType::I32 => dump_inner(self.as_slice::<i32>(), full),
            DType::U32 => dump_inner(self.as_slice::<u32>(), full),
        }
    }
}

impl From<RawCPUBuffer> for CPUBuffer {
    fn from(raw: RawCPUBuffer) -> Self {
        CPUBuffer { inner: raw }
    }
}
