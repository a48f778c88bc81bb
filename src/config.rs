use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, bail};

use crate::quantization::QuantizationMode;

pub const DEFAULT_BASE_MODEL: &str = "unsloth/llama-3.1-8b-instruct-bnb-4bit";

/// Which device the operator asked for. Resolution against the hardware
/// actually present happens in the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    Auto,
    Cpu,
    Cuda(usize),
}

impl FromStr for DeviceRequest {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lower = raw.trim().to_lowercase();
        match lower.as_str() {
            "" | "auto" => Ok(DeviceRequest::Auto),
            "cpu" => Ok(DeviceRequest::Cpu),
            "cuda" | "gpu" => Ok(DeviceRequest::Cuda(0)),
            other => match other.strip_prefix("cuda:") {
                Some(idx) => idx
                    .parse::<usize>()
                    .map(DeviceRequest::Cuda)
                    .with_context(|| format!("invalid cuda ordinal in DEVICE={raw}")),
                None => bail!("unsupported DEVICE value: {raw}"),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub base_model: String,
    pub base_model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub adapter_path: PathBuf,
    pub quantization: QuantizationMode,
    pub device: DeviceRequest,
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
    pub stats_cpu_window: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("SERVER_ADDR")
            .unwrap_or_else(|| "127.0.0.1:5000".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000));

        let base_model = lookup("BASE_MODEL").unwrap_or_else(|| DEFAULT_BASE_MODEL.to_string());
        let base_model_path = PathBuf::from(
            lookup("BASE_MODEL_PATH")
                .unwrap_or_else(|| "models/llama-3.1-8b-instruct.ts".to_string()),
        );
        let tokenizer_path = PathBuf::from(
            lookup("TOKENIZER_PATH").unwrap_or_else(|| "models/tokenizer.json".to_string()),
        );
        let adapter_path =
            PathBuf::from(lookup("ADAPTER_PATH").unwrap_or_else(|| "./adapters".to_string()));

        let quantization = match lookup("QUANTIZATION") {
            Some(raw) => raw.parse()?,
            None => QuantizationMode::Float16,
        };
        let device = match lookup("DEVICE") {
            Some(raw) => raw.parse()?,
            None => DeviceRequest::Auto,
        };

        let max_tokens = parse_or(&lookup, "MAX_TOKENS", 512usize)?;
        let temperature = parse_or(&lookup, "TEMPERATURE", 0.7f64)?;
        let top_p = parse_or(&lookup, "TOP_P", 0.9f64)?;
        let seed = lookup("GENERATION_SEED")
            .map(|raw| raw.parse::<u64>())
            .transpose()
            .context("GENERATION_SEED must be an unsigned integer")?;
        let stats_cpu_window =
            Duration::from_millis(parse_or(&lookup, "STATS_CPU_WINDOW_MS", 1000u64)?);

        if max_tokens == 0 {
            bail!("MAX_TOKENS must be positive");
        }
        if !(0.0..=1.0).contains(&temperature) {
            bail!("TEMPERATURE must be within [0, 1], got {temperature}");
        }
        if !(top_p > 0.0 && top_p <= 1.0) {
            bail!("TOP_P must be within (0, 1], got {top_p}");
        }

        Ok(Self {
            listen_addr,
            base_model,
            base_model_path,
            tokenizer_path,
            adapter_path,
            quantization,
            device,
            max_tokens,
            temperature,
            top_p,
            seed,
            stats_cpu_window,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        None => Ok(default),
    }
}
