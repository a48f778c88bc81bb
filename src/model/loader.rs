use std::{
    panic::{self, AssertUnwindSafe},
    path::Path,
    sync::Arc,
    time::Instant,
};

use tch::{CModule, Cuda};
use tokenizers::Tokenizer;
use tracing::{error, info, warn};

use crate::{
    config::{AppConfig, DeviceRequest},
    error::ServiceError,
    model::{
        ComputeDevice, LoadedModel, ModelMetadata, ModelState, adapter::LoraAdapter,
        tch_backend::{TorchCausalLm, to_torch_device},
    },
    monitor::ResourceMonitor,
    quantization::{QuantizationMode, QuantizationSummary},
};

/// One-shot startup acquisition of base model, tokenizer and adapter.
pub struct ModelLoader<'a> {
    config: &'a AppConfig,
    monitor: &'a ResourceMonitor,
}

impl<'a> ModelLoader<'a> {
    pub fn new(config: &'a AppConfig, monitor: &'a ResourceMonitor) -> Self {
        Self { config, monitor }
    }

    /// Runs every load step in order. Any failure leaves nothing loaded.
    pub fn load(&self) -> Result<ModelState, ServiceError> {
        info!(base_model = %self.config.base_model, "starting model load");
        let started = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.load_steps()))
            .unwrap_or_else(|_| Err(ServiceError::Other("model load panicked".into())));

        match outcome {
            Ok(state) => {
                info!(
                    elapsed_s = started.elapsed().as_secs_f64(),
                    gpu_memory = ?self.monitor.snapshot(),
                    "model loaded"
                );
                Ok(state)
            }
            Err(err) => {
                error!(error = %err, detail = ?err, "model load failed");
                Err(err)
            }
        }
    }

    fn load_steps(&self) -> Result<ModelState, ServiceError> {
        let device = self.resolve_device();
        let mode = self.config.quantization.for_device(device);
        if mode != self.config.quantization {
            warn!(requested = %self.config.quantization, using = %mode, "precision not supported on cpu");
        }

        info!(path = %self.config.base_model_path.display(), dtype = %mode, %device, "loading base model");
        let mut module = load_base_module(&self.config.base_model_path, device, mode)?;

        info!(path = %self.config.tokenizer_path.display(), "loading tokenizer");
        let tokenizer = Tokenizer::from_file(self.config.tokenizer_path.as_path())
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        info!(path = %self.config.adapter_path.display(), "loading LoRA adapter");
        let adapter = LoraAdapter::load(&self.config.adapter_path)?;
        if let Some(declared) = adapter.config().base_model_name_or_path.as_deref() {
            if declared != self.config.base_model {
                warn!(adapter_base = declared, base_model = %self.config.base_model, "adapter was trained against a different base model");
            }
        }
        let merged = adapter.merge_into(&module)?;
        info!(merged, rank = adapter.config().r, scaling = adapter.config().scaling(), "adapter merged");

        module.set_eval();
        let parameter_count = freeze_parameters(&module)?;
        let quantization = QuantizationSummary::from_parameters(mode, parameter_count);
        if device.is_accelerator() {
            self.monitor.record_resident(quantization.resident_bytes);
        }

        if let Some(seed) = self.config.seed {
            tch::manual_seed(seed as i64);
        }

        let metadata = ModelMetadata {
            base_model: self.config.base_model.clone(),
            adapter: self.config.adapter_path.display().to_string(),
            dtype: mode.dtype().to_string(),
            merged_adapter_layers: merged,
            quantization,
        };

        Ok(ModelState::loaded(
            device,
            LoadedModel {
                model: Arc::new(TorchCausalLm::new(module, device)),
                codec: Arc::new(tokenizer),
                metadata: Some(metadata),
            },
        ))
    }

    fn resolve_device(&self) -> ComputeDevice {
        let cuda = Cuda::is_available();
        if cuda {
            info!(
                gpu = ?self.monitor.gpu_name(),
                devices = Cuda::device_count(),
                cudnn = Cuda::cudnn_is_available(),
                "CUDA available"
            );
        }

        match (self.config.device, cuda) {
            (DeviceRequest::Cpu, _) => ComputeDevice::Cpu,
            (DeviceRequest::Auto, true) => ComputeDevice::Cuda(0),
            (DeviceRequest::Cuda(idx), true) if (idx as i64) < Cuda::device_count() => {
                ComputeDevice::Cuda(idx)
            }
            (requested, _) => {
                warn!(?requested, "CUDA not available, falling back to cpu (very slow)");
                ComputeDevice::Cpu
            }
        }
    }
}

fn load_base_module(
    path: &Path,
    device: ComputeDevice,
    mode: QuantizationMode,
) -> Result<CModule, ServiceError> {
    if !path.exists() {
        return Err(ServiceError::Other(format!(
            "model artifact missing: {}",
            path.display()
        )));
    }
    let torch_device = to_torch_device(device);
    let mut module = CModule::load_on_device(path, torch_device)
        .map_err(|e| ServiceError::Other(format!("failed to load base model: {e}")))?;
    module.f_to(torch_device, mode.kind(), false).map_err(|e| {
        ServiceError::Quantization(format!("failed to cast base model to {mode}: {e}"))
    })?;
    Ok(module)
}

/// Disables gradient tracking on every parameter and returns their count.
fn freeze_parameters(module: &CModule) -> Result<u64, ServiceError> {
    let mut count = 0u64;
    for (_, parameter) in module.named_parameters()? {
        let _ = parameter.set_requires_grad(false);
        count += parameter.numel() as u64;
    }
    Ok(count)
}
