use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lora_codegen_service::{
    AppConfig, ModelState, ResourceMonitor, build_router, config::DeviceRequest,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();
    init_tracing();
    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(?config.listen_addr, "starting code generation server");

    let ordinal = match config.device {
        DeviceRequest::Cuda(idx) => idx,
        DeviceRequest::Auto | DeviceRequest::Cpu => 0,
    };
    let monitor = Arc::new(ResourceMonitor::detect(ordinal));

    // A server without a model is useless: load failures end the process.
    let model = Arc::new(load_model(config.as_ref(), monitor.as_ref())?);
    let router = build_router(config.clone(), model, monitor);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(feature = "tch-backend")]
fn load_model(config: &AppConfig, monitor: &ResourceMonitor) -> anyhow::Result<ModelState> {
    let state = lora_codegen_service::model::ModelLoader::new(config, monitor).load()?;
    Ok(state)
}

#[cfg(not(feature = "tch-backend"))]
fn load_model(_config: &AppConfig, _monitor: &ResourceMonitor) -> anyhow::Result<ModelState> {
    anyhow::bail!("built without a model backend; enable the `tch-backend` feature")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
