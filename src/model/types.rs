use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

use crate::{error::ServiceError, monitor::MemorySnapshot, quantization::QuantizationSummary};

pub const MAX_PROMPT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
    Cpu,
    Cuda(usize),
}

impl ComputeDevice {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, ComputeDevice::Cuda(_))
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDevice::Cpu => f.write_str("cpu"),
            ComputeDevice::Cuda(_) => f.write_str("cuda"),
        }
    }
}

impl Serialize for ComputeDevice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f64>,
}

/// A request that passed boundary validation. Only these reach the pipeline.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f64>,
}

impl GenerationRequest {
    pub fn validate(self) -> Result<ValidatedRequest, ServiceError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(ServiceError::BadRequest("prompt must not be empty".into()));
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(ServiceError::BadRequest(format!(
                "prompt too long (max {MAX_PROMPT_CHARS} chars)"
            )));
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=1.0).contains(&temperature) {
                return Err(ServiceError::BadRequest(
                    "temperature must be between 0 and 1".into(),
                ));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(ServiceError::BadRequest(
                "max_tokens must be a positive integer".into(),
            ));
        }

        Ok(ValidatedRequest {
            prompt: prompt.to_string(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
}

/// Service-wide fallbacks for parameters a request leaves out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationDefaults {
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
}

impl GenerationDefaults {
    pub fn resolve(&self, max_tokens: Option<usize>, temperature: Option<f64>) -> SamplingParams {
        SamplingParams {
            max_new_tokens: max_tokens.unwrap_or(self.max_tokens),
            temperature: temperature.unwrap_or(self.temperature),
            top_p: self.top_p,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedCode {
    pub code: String,
    pub tokens_generated: usize,
    pub inference_time_ms: f64,
    pub model_loaded: bool,
    pub gpu_memory: MemorySnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationFailure {
    pub error: String,
    pub code: String,
    pub model_loaded: bool,
}

#[derive(Debug, Clone)]
pub enum GenerationResult {
    Success(GeneratedCode),
    Failure(GenerationFailure),
}

impl GenerationResult {
    pub fn failure(error: &ServiceError, model_loaded: bool) -> Self {
        GenerationResult::Failure(GenerationFailure {
            error: error.to_string(),
            code: String::new(),
            model_loaded,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, GenerationResult::Success(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            GenerationResult::Success(_) => None,
            GenerationResult::Failure(failure) => Some(&failure.error),
        }
    }
}

impl Serialize for GenerationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Flagged<'a, T> {
            success: bool,
            #[serde(flatten)]
            body: &'a T,
        }

        match self {
            GenerationResult::Success(body) => Flagged { success: true, body }.serialize(serializer),
            GenerationResult::Failure(body) => {
                Flagged { success: false, body }.serialize(serializer)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub base_model: String,
    pub adapter: String,
    pub dtype: String,
    pub merged_adapter_layers: usize,
    pub quantization: QuantizationSummary,
}
