use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use tokio::task;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        ComputeDevice, GenerationDefaults, GenerationPipeline, GenerationRequest,
        GenerationResult, InferenceService, ModelMetadata, ModelState,
    },
    monitor::{MemorySnapshot, ResourceMonitor, SystemStats},
};

#[cfg(feature = "tch-backend")]
pub const FRAMEWORK_VERSION: &str = "libtorch 2.7.0 (tch 0.20)";
#[cfg(not(feature = "tch-backend"))]
pub const FRAMEWORK_VERSION: &str = "none";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub service: Arc<InferenceService>,
    pub monitor: Arc<ResourceMonitor>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    device: ComputeDevice,
    gpu_available: bool,
    gpu_name: String,
    gpu_memory: MemorySnapshot,
}

#[derive(Serialize)]
struct ClearCacheResponse {
    status: &'static str,
    gpu_memory: MemorySnapshot,
}

#[derive(Serialize)]
struct StatsResponse {
    model_loaded: bool,
    device: ComputeDevice,
    gpu_memory: MemorySnapshot,
    #[serde(flatten)]
    system: SystemStats,
    cuda_available: bool,
    framework_version: &'static str,
    model: Option<ModelMetadata>,
}

pub fn build_router(
    config: Arc<AppConfig>,
    model: Arc<ModelState>,
    monitor: Arc<ResourceMonitor>,
) -> Router {
    let defaults = GenerationDefaults {
        max_tokens: config.max_tokens,
        temperature: config.temperature,
        top_p: config.top_p,
    };
    let pipeline = GenerationPipeline::new(model, monitor.clone(), defaults);
    let state = AppState {
        service: Arc::new(InferenceService::new(pipeline)),
        monitor,
        config,
    };

    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/clear-cache", post(clear_cache))
        .route("/stats", get(stats))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let model = state.service.state();
    Json(HealthResponse {
        status: "online",
        model_loaded: model.is_loaded(),
        device: model.device(),
        gpu_available: state.monitor.gpu_available(),
        gpu_name: state.monitor.gpu_name().unwrap_or_else(|| "N/A".to_string()),
        gpu_memory: state.monitor.snapshot(),
    })
}

async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<GenerationResult>), ServiceError> {
    let Json(request) = payload.map_err(|rejection| {
        ServiceError::BadRequest(format!("no valid JSON body: {}", rejection.body_text()))
    })?;
    let request = request.validate()?;

    let result = state.service.generate(request).await?;
    let status = if result.is_success() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(result)))
}

async fn clear_cache(State(state): State<AppState>) -> Json<ClearCacheResponse> {
    state.monitor.clear();
    Json(ClearCacheResponse {
        status: "cache cleared",
        gpu_memory: state.monitor.snapshot(),
    })
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ServiceError> {
    let window = state.config.stats_cpu_window;
    let system = task::spawn_blocking(move || SystemStats::sample(window))
        .await
        .map_err(|err| ServiceError::Other(format!("stats task failed: {err}")))?;

    let model = state.service.state();
    info!(cpu = system.cpu_usage_percent, ram = system.ram_usage_percent, "stats sampled");

    Ok(Json(StatsResponse {
        model_loaded: model.is_loaded(),
        device: model.device(),
        gpu_memory: state.monitor.snapshot(),
        system,
        cuda_available: state.monitor.cuda_available(),
        framework_version: FRAMEWORK_VERSION,
        model: model.metadata().cloned(),
    }))
}
