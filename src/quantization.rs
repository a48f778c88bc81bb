use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::model::ComputeDevice;

/// Precision the base model weights are held in once loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationMode {
    Float16,
    BFloat16,
    Float32,
}

impl QuantizationMode {
    pub fn dtype(&self) -> &'static str {
        match self {
            QuantizationMode::Float16 => "float16",
            QuantizationMode::BFloat16 => "bfloat16",
            QuantizationMode::Float32 => "float32",
        }
    }

    pub fn bytes_per_weight(&self) -> u64 {
        match self {
            QuantizationMode::Float16 | QuantizationMode::BFloat16 => 2,
            QuantizationMode::Float32 => 4,
        }
    }

    /// libtorch has no usable fp16 matmul kernels on most CPUs, so half
    /// precision is widened there. bf16 is kept as is.
    pub fn for_device(self, device: ComputeDevice) -> Self {
        match (self, device) {
            (QuantizationMode::Float16, ComputeDevice::Cpu) => QuantizationMode::Float32,
            (mode, _) => mode,
        }
    }

    #[cfg(feature = "tch-backend")]
    pub fn kind(&self) -> tch::Kind {
        match self {
            QuantizationMode::Float16 => tch::Kind::Half,
            QuantizationMode::BFloat16 => tch::Kind::BFloat16,
            QuantizationMode::Float32 => tch::Kind::Float,
        }
    }
}

impl fmt::Display for QuantizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dtype())
    }
}

impl FromStr for QuantizationMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "float16" | "fp16" | "half" => Ok(QuantizationMode::Float16),
            "bfloat16" | "bf16" => Ok(QuantizationMode::BFloat16),
            "float32" | "fp32" | "full" => Ok(QuantizationMode::Float32),
            other => anyhow::bail!("unsupported QUANTIZATION value: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuantizationSummary {
    pub mode: QuantizationMode,
    pub parameter_count: u64,
    pub resident_bytes: u64,
    pub full_precision_bytes: u64,
    pub size_reduction_percent: f64,
}

impl QuantizationSummary {
    pub fn from_parameters(mode: QuantizationMode, parameter_count: u64) -> QuantizationSummary {
        let resident_bytes = parameter_count * mode.bytes_per_weight();
        let full_precision_bytes = parameter_count * QuantizationMode::Float32.bytes_per_weight();
        let reduction = if full_precision_bytes == 0 {
            0.0
        } else {
            let diff = full_precision_bytes.saturating_sub(resident_bytes) as f64;
            (diff / full_precision_bytes as f64) * 100.0
        };

        QuantizationSummary {
            mode,
            parameter_count,
            resident_bytes,
            full_precision_bytes,
            size_reduction_percent: reduction,
        }
    }
}
