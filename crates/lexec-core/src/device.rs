use derive_new::new;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device mismatch, requested device: {requested}, actual device: {actual}")]
    DeviceMismatch { requested: usize, actual: usize },
}

/// A value that is only meaningful on the device it was created for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceSpecific<T> {
    device_idx: usize,
    value: T,
}

impl<T> DeviceSpecific<T> {
    pub fn create(device_idx: usize, value: T) -> Self {
        Self { device_idx, value }
    }

    pub fn device_idx(&self) -> usize {
        self.device_idx
    }

    pub fn get(&self, device_idx: usize) -> Result<&T, DeviceError> {
        if device_idx != self.device_idx {
            return Err(DeviceError::DeviceMismatch {
                requested: device_idx,
                actual: self.device_idx,
            });
        }
        Ok(&self.value)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DeviceSpecific<U> {
        DeviceSpecific {
            device_idx: self.device_idx,
            value: f(self.value),
        }
    }
}

/// Library handle for one device: workspace sizing and math-mode settings
/// handed to kernels that need scratch space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new, Serialize, Deserialize)]
pub struct PerDeviceHandle {
    pub workspace_size: usize,
    pub allow_tensor_op_math_conversion: bool,
}

impl Default for PerDeviceHandle {
    fn default() -> Self {
        Self::new(1 << 20, false)
    }
}
