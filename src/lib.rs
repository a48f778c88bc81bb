pub mod config;
pub mod error;
pub mod model;
pub mod monitor;
pub mod quantization;
pub mod server;

pub use config::AppConfig;
pub use model::{GenerationPipeline, GenerationRequest, GenerationResult, ModelState};
pub use monitor::ResourceMonitor;
pub use server::build_router;
