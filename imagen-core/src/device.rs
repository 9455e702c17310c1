use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;

/// Execution device for one engine. Chosen once at engine construction and
/// fixed for that engine's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

impl DeviceKind {
    /// Parse an operator override token. Case-insensitive; `mps` is accepted
    /// as an alias for the Apple accelerator.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(Self::Cpu),
            "cuda" => Some(Self::Cuda),
            "metal" | "mps" => Some(Self::Metal),
            _ => None,
        }
    }

    /// Probe the hardware: discrete GPU, then Apple unified memory, then CPU.
    pub fn probe() -> Self {
        if cuda_is_available() {
            Self::Cuda
        } else if metal_is_available() {
            Self::Metal
        } else {
            Self::Cpu
        }
    }

    /// Resolve the device for an engine. A recognized override wins over
    /// probing, which lets an operator force CPU on accelerated hardware.
    pub fn resolve(overridden: Option<&str>) -> Self {
        overridden.and_then(Self::from_token).unwrap_or_else(Self::probe)
    }

    pub fn to_device(self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda => Ok(Device::new_cuda(0)?),
            Self::Metal => Ok(Device::new_metal(0)?),
        }
    }

    /// Device the seeded random source binds to. The Metal RNG does not
    /// reproduce across runs, so noise for Metal engines is drawn on the CPU
    /// and uploaded; everywhere else the source follows the model device.
    pub fn rng_binding(self) -> Self {
        match self {
            Self::Cpu => Self::Cpu,
            Self::Cuda => Self::Cuda,
            Self::Metal => Self::Cpu,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
        };
        f.write_str(name)
    }
}
