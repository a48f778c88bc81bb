use std::sync::Arc;

use tokio::{sync::Mutex, task};

use crate::{
    error::ServiceError,
    model::{GenerationPipeline, GenerationResult, ModelState, ValidatedRequest},
};

/// Async front of the pipeline. Generations are serialized through a single
/// permit and executed on the blocking pool.
pub struct InferenceService {
    pipeline: Arc<GenerationPipeline>,
    gate: Mutex<()>,
}

impl InferenceService {
    pub fn new(pipeline: GenerationPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            gate: Mutex::new(()),
        }
    }

    pub fn state(&self) -> &ModelState {
        self.pipeline.state()
    }

    pub async fn generate(
        &self,
        request: ValidatedRequest,
    ) -> Result<GenerationResult, ServiceError> {
        let _permit = self.gate.lock().await;
        let pipeline = self.pipeline.clone();

        task::spawn_blocking(move || {
            pipeline.generate(&request.prompt, request.max_tokens, request.temperature)
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))
    }
}
