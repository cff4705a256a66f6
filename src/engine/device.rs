use std::fmt;
use std::str::FromStr;

use anyhow::{Error as E, Result};
use candle_core::Device;

/// Hardware selector accepted by `create(kind, model_path, device)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelector {
    /// First accelerator available, CPU otherwise.
    Auto,
    Cpu,
    /// CUDA ordinal.
    Gpu(usize),
    Metal,
}

impl FromStr for DeviceSelector {
    type Err = E;

    fn from_str(raw: &str) -> Result<Self> {
        let upper = raw.trim().to_uppercase();

        match upper.as_str() {
            "" | "AUTO" => return Ok(Self::Auto),
            "CPU" => return Ok(Self::Cpu),
            "GPU" | "CUDA" => return Ok(Self::Gpu(0)),
            "METAL" | "MPS" => return Ok(Self::Metal),
            _ => {}
        }

        let ordinal = upper
            .strip_prefix("GPU.")
            .or_else(|| upper.strip_prefix("CUDA:"));
        if let Some(ordinal) = ordinal {
            let ordinal = ordinal
                .parse::<usize>()
                .map_err(|_| E::msg(format!("Invalid device ordinal in '{}'", raw)))?;
            return Ok(Self::Gpu(ordinal));
        }

        Err(E::msg(format!("Unsupported device '{}'", raw)))
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "AUTO"),
            Self::Cpu => write!(f, "CPU"),
            Self::Gpu(n) => write!(f, "GPU.{}", n),
            Self::Metal => write!(f, "METAL"),
        }
    }
}

impl DeviceSelector {
    pub fn to_candle(self) -> Result<Device> {
        let device = match self {
            Self::Cpu => Device::Cpu,
            Self::Gpu(ordinal) => Device::new_cuda(ordinal)?,
            Self::Metal => Device::new_metal(0)?,
            Self::Auto => {
                if candle_core::utils::cuda_is_available() {
                    Device::new_cuda(0)?
                } else if candle_core::utils::metal_is_available() {
                    Device::new_metal(0)?
                } else {
                    Device::Cpu
                }
            }
        };
        Ok(device)
    }
}
