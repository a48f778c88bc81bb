pub mod adapter;
mod backend;
mod pipeline;
mod service;
mod state;
pub mod template;
mod types;

#[cfg(feature = "tch-backend")]
mod loader;
#[cfg(feature = "tch-backend")]
pub mod sampling;
#[cfg(feature = "tch-backend")]
pub mod tch_backend;

pub use backend::{CausalLm, Completion, TextCodec};
#[cfg(feature = "tch-backend")]
pub use loader::ModelLoader;
pub use pipeline::GenerationPipeline;
pub use service::InferenceService;
pub use state::{LoadedModel, ModelState};
pub use types::{
    ComputeDevice, GeneratedCode, GenerationDefaults, GenerationFailure, GenerationRequest,
    GenerationResult, MAX_PROMPT_CHARS, ModelMetadata, SamplingParams, ValidatedRequest,
};
