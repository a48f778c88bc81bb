//! Device memory accounting and host statistics.
//!
//! `allocated` is the byte count of tensors this process keeps resident on
//! the accelerator (the model weights, recorded by the loader). `reserved`
//! is what the driver reports the process as holding, which includes the
//! allocator's cache and the CUDA context.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration,
};

use nvml_wrapper::{Nvml, enums::device::UsedGpuMemory, error::NvmlError};
use serde::Serialize;
use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, System};
use tracing::{debug, info, warn};

const BYTES_PER_GB: f64 = 1e9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemorySnapshot {
    pub allocated_gb: f64,
    pub reserved_gb: f64,
}

impl MemorySnapshot {
    fn from_bytes(allocated: u64, reserved: u64) -> Self {
        Self {
            allocated_gb: to_gb(allocated),
            reserved_gb: to_gb(reserved.max(allocated)),
        }
    }
}

/// Read access to one accelerator's driver-level state.
pub trait MemorySource: Send + Sync {
    fn device_name(&self) -> Option<String>;

    fn reserved_bytes(&self) -> u64;

    /// Hands cached, unused blocks back to the device. Must be idempotent.
    fn release_cached(&self);
}

pub struct ResourceMonitor {
    source: Option<Box<dyn MemorySource>>,
    cuda_available: bool,
    resident_bytes: AtomicU64,
}

impl ResourceMonitor {
    /// Inspects CUDA device `ordinal`. Missing drivers leave a CPU-only monitor.
    pub fn detect(ordinal: usize) -> Self {
        let cuda_available = cuda_available();
        if !cuda_available {
            return Self::cpu_only();
        }

        match NvmlMemory::new(ordinal) {
            Ok(source) => {
                info!(gpu = ?source.device_name(), ordinal, "NVML memory source attached");
                Self::with_source(Box::new(source), true)
            }
            Err(err) => {
                warn!(error = %err, "NVML unavailable, GPU memory will read as zero");
                Self {
                    source: None,
                    cuda_available,
                    resident_bytes: AtomicU64::new(0),
                }
            }
        }
    }

    pub fn cpu_only() -> Self {
        Self {
            source: None,
            cuda_available: false,
            resident_bytes: AtomicU64::new(0),
        }
    }

    pub fn with_source(source: Box<dyn MemorySource>, cuda_available: bool) -> Self {
        Self {
            source: Some(source),
            cuda_available,
            resident_bytes: AtomicU64::new(0),
        }
    }

    pub fn cuda_available(&self) -> bool {
        self.cuda_available
    }

    pub fn gpu_available(&self) -> bool {
        self.cuda_available && self.source.is_some()
    }

    pub fn gpu_name(&self) -> Option<String> {
        self.source.as_ref().and_then(|source| source.device_name())
    }

    /// Adds `bytes` of accelerator-resident tensors to the allocation ledger.
    pub fn record_resident(&self, bytes: u64) {
        if self.source.is_some() {
            self.resident_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        match &self.source {
            Some(source) => MemorySnapshot::from_bytes(
                self.resident_bytes.load(Ordering::Relaxed),
                source.reserved_bytes(),
            ),
            None => MemorySnapshot::default(),
        }
    }

    /// Never touches the resident weights, only the allocator's spare blocks.
    pub fn clear(&self) {
        if let Some(source) = &self.source {
            source.release_cached();
            info!("GPU cache cleared");
        }
    }
}

#[cfg(feature = "tch-backend")]
fn cuda_available() -> bool {
    tch::Cuda::is_available()
}

#[cfg(not(feature = "tch-backend"))]
fn cuda_available() -> bool {
    Nvml::init()
        .and_then(|nvml| nvml.device_count())
        .map(|count| count > 0)
        .unwrap_or(false)
}

pub struct NvmlMemory {
    nvml: Nvml,
    index: u32,
}

impl NvmlMemory {
    pub fn new(ordinal: usize) -> Result<Self, NvmlError> {
        let nvml = Nvml::init()?;
        let index = ordinal as u32;
        nvml.device_by_index(index)?;
        Ok(Self { nvml, index })
    }
}

impl MemorySource for NvmlMemory {
    fn device_name(&self) -> Option<String> {
        self.nvml
            .device_by_index(self.index)
            .and_then(|device| device.name())
            .ok()
    }

    fn reserved_bytes(&self) -> u64 {
        let device = match self.nvml.device_by_index(self.index) {
            Ok(device) => device,
            Err(err) => {
                debug!(error = %err, "NVML device lookup failed");
                return 0;
            }
        };
        let pid = std::process::id();
        match device.running_compute_processes() {
            Ok(processes) => processes
                .iter()
                .filter(|process| process.pid == pid)
                .map(|process| match process.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => bytes,
                    UsedGpuMemory::Unavailable => 0,
                })
                .sum(),
            Err(err) => {
                debug!(error = %err, "NVML process query failed");
                0
            }
        }
    }

    fn release_cached(&self) {
        // Pending frees must retire before the allocator can hand blocks back.
        #[cfg(feature = "tch-backend")]
        tch::Cuda::synchronize(self.index as i64);
        #[cfg(cuda_cache)]
        empty_cuda_cache();
    }
}

#[cfg(cuda_cache)]
unsafe extern "C" {
    fn lcs_empty_cuda_cache();
}

/// Returns libtorch's cached, unused CUDA blocks to the driver.
#[cfg(cuda_cache)]
fn empty_cuda_cache() {
    // SAFETY: the shim takes no arguments and swallows every C++ exception.
    unsafe { lcs_empty_cuda_cache() }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SystemStats {
    pub cpu_usage_percent: f32,
    pub ram_usage_percent: f64,
    pub ram_available_gb: f64,
}

impl SystemStats {
    /// Blocks for `window` (at least sysinfo's minimum) to measure CPU load.
    pub fn sample(window: Duration) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        thread::sleep(window.max(MINIMUM_CPU_UPDATE_INTERVAL));
        system.refresh_cpu();
        system.refresh_memory();

        let total = system.total_memory();
        let available = system.available_memory();
        let ram_usage_percent = if total == 0 {
            0.0
        } else {
            let used = total.saturating_sub(available) as f64;
            round2(used / total as f64 * 100.0)
        };

        Self {
            cpu_usage_percent: system.global_cpu_info().cpu_usage(),
            ram_usage_percent,
            ram_available_gb: to_gb(available),
        }
    }
}

fn to_gb(bytes: u64) -> f64 {
    round2(bytes as f64 / BYTES_PER_GB)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
