use std::sync::Arc;

use crate::model::{CausalLm, ComputeDevice, ModelMetadata, TextCodec};

/// Handles produced by a successful load.
pub struct LoadedModel {
    pub model: Arc<dyn CausalLm>,
    pub codec: Arc<dyn TextCodec>,
    pub metadata: Option<ModelMetadata>,
}

/// Process-wide model context, built once at startup and shared by reference.
pub struct ModelState {
    device: ComputeDevice,
    loaded: Option<LoadedModel>,
}

impl ModelState {
    pub fn unloaded(device: ComputeDevice) -> Self {
        Self {
            device,
            loaded: None,
        }
    }

    pub fn loaded(device: ComputeDevice, model: LoadedModel) -> Self {
        Self {
            device,
            loaded: Some(model),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn device(&self) -> ComputeDevice {
        self.device
    }

    pub fn handles(&self) -> Option<&LoadedModel> {
        self.loaded.as_ref()
    }

    pub fn metadata(&self) -> Option<&ModelMetadata> {
        self.loaded.as_ref().and_then(|m| m.metadata.as_ref())
    }
}
