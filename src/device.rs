use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Compute device requested by the configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// Metal, then CUDA, then CPU.
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DevicePreference {
    /// Resolves the preference into a candle device. `Auto` never fails; the
    /// explicit accelerators do when the backend cannot be initialized.
    pub fn resolve(self) -> Result<Device, TrainingError> {
        match self {
            DevicePreference::Cpu => Ok(Device::Cpu),
            DevicePreference::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to initialize CUDA device #{ordinal}: {err}"
                ))
            }),
            DevicePreference::Metal(ordinal) => Device::new_metal(ordinal).map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to initialize Metal device #{ordinal}: {err}"
                ))
            }),
            DevicePreference::Auto => Ok(detect_device()),
        }
    }
}

fn detect_device() -> Device {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    log::info!(
        "device detection: cuda_available={} metal_available={}",
        cuda_available,
        metal_available
    );

    if metal_available {
        match Device::new_metal(0) {
            Ok(device) => {
                log::info!("device: using Metal GPU #0");
                return device;
            }
            Err(err) => {
                log::warn!("failed to initialize metal device, falling back: {}", err);
            }
        }
    }

    if cuda_available {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                log::info!("device: using CUDA GPU #0");
                return device;
            }
            Err(err) => {
                log::warn!("cuda reported available but initialization failed: {err}");
            }
        }
    }

    log::info!("no GPU backend available; using CPU");
    Device::Cpu
}
