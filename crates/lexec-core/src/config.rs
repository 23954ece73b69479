use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::{DeviceSpecific, PerDeviceHandle};

/// Controls kernel timing. With `measure_iters == 0` every task runs once and
/// reports no elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, new, Serialize, Deserialize)]
pub struct ProfilingSettings {
    pub warmup_iters: usize,
    pub measure_iters: usize,
}

impl ProfilingSettings {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.measure_iters > 0
    }
}

/// Session-global values that `RuntimeArgRef`s resolve against.
#[derive(Debug, Clone, PartialEq, new, Serialize, Deserialize)]
pub struct RuntimeArgConfig {
    pub handle: DeviceSpecific<PerDeviceHandle>,
    #[serde(default)]
    pub profiling_settings: ProfilingSettings,
}

impl RuntimeArgConfig {
    pub fn device_idx(&self) -> usize {
        self.handle.device_idx()
    }
}

impl Default for RuntimeArgConfig {
    fn default() -> Self {
        Self::new(
            DeviceSpecific::create(0, PerDeviceHandle::default()),
            ProfilingSettings::disabled(),
        )
    }
}
