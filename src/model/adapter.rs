//! PEFT LoRA adapters: `adapter_config.json` plus `adapter_model.safetensors`.
//!
//! The low-rank update `B·A·(alpha/r)` is folded into the matching base
//! weight once at load time, so inference runs on a single merged module.

use std::{fs, path::Path};

use serde::Deserialize;

use crate::error::ServiceError;

pub const CONFIG_FILE: &str = "adapter_config.json";
pub const WEIGHTS_FILE: &str = "adapter_model.safetensors";

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub peft_type: Option<String>,
}

impl AdapterConfig {
    pub fn from_dir(dir: &Path) -> Result<Self, ServiceError> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Err(ServiceError::Adapter(format!(
                "adapter config missing: {}",
                path.display()
            )));
        }
        let raw = fs::read_to_string(&path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ServiceError> {
        let config: AdapterConfig = serde_json::from_str(raw)
            .map_err(|e| ServiceError::Adapter(format!("invalid adapter config: {e}")))?;
        if config.r == 0 {
            return Err(ServiceError::Adapter("adapter rank must be positive".into()));
        }
        if let Some(kind) = config.peft_type.as_deref() {
            if !kind.eq_ignore_ascii_case("lora") {
                return Err(ServiceError::Adapter(format!(
                    "unsupported adapter type: {kind}"
                )));
            }
        }
        Ok(config)
    }

    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraPart {
    A,
    B,
}

/// Maps an adapter tensor name to the base weight it updates.
///
/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight`
/// becomes `model.layers.0.self_attn.q_proj.weight`. Named adapters
/// (`lora_A.default.weight`) resolve the same way.
pub fn target_weight(key: &str) -> Option<(String, LoraPart)> {
    if !key.ends_with(".weight") {
        return None;
    }
    let key = key.strip_prefix("base_model.model.").unwrap_or(key);
    [(".lora_A.", LoraPart::A), (".lora_B.", LoraPart::B)]
        .into_iter()
        .find_map(|(marker, part)| {
            key.rfind(marker)
                .map(|pos| (format!("{}.weight", &key[..pos]), part))
        })
}

/// Traced modules may nest the language model under an extra prefix, or
/// drop one. A shortened name must still carry a module path, so a bare
/// `weight` never matches.
pub fn matches_parameter(parameter: &str, target: &str) -> bool {
    parameter == target
        || parameter.ends_with(&format!(".{target}"))
        || (parameter.contains('.') && target.ends_with(&format!(".{parameter}")))
}

#[cfg(feature = "tch-backend")]
pub use merge::LoraAdapter;

#[cfg(feature = "tch-backend")]
mod merge {
    use std::{collections::BTreeMap, path::Path};

    use tch::{CModule, Kind, Tensor};
    use tracing::{debug, warn};

    use super::{AdapterConfig, LoraPart, WEIGHTS_FILE, matches_parameter, target_weight};
    use crate::error::ServiceError;

    struct LoraPair {
        target: String,
        a: Tensor,
        b: Tensor,
    }

    pub struct LoraAdapter {
        config: AdapterConfig,
        pairs: Vec<LoraPair>,
    }

    impl LoraAdapter {
        pub fn load(dir: &Path) -> Result<Self, ServiceError> {
            let config = AdapterConfig::from_dir(dir)?;
            let weights_path = dir.join(WEIGHTS_FILE);
            if !weights_path.exists() {
                return Err(ServiceError::Adapter(format!(
                    "adapter weights missing: {}",
                    weights_path.display()
                )));
            }

            let tensors = Tensor::read_safetensors(&weights_path)
                .map_err(|e| ServiceError::Adapter(e.to_string()))?;

            let mut halves: BTreeMap<String, (Option<Tensor>, Option<Tensor>)> = BTreeMap::new();
            for (name, tensor) in tensors {
                match target_weight(&name) {
                    Some((target, LoraPart::A)) => halves.entry(target).or_default().0 = Some(tensor),
                    Some((target, LoraPart::B)) => halves.entry(target).or_default().1 = Some(tensor),
                    None => debug!(tensor = %name, "skipping non-LoRA adapter tensor"),
                }
            }

            let mut pairs = Vec::with_capacity(halves.len());
            for (target, halves) in halves {
                match halves {
                    (Some(a), Some(b)) => pairs.push(LoraPair { target, a, b }),
                    _ => {
                        return Err(ServiceError::Adapter(format!(
                            "incomplete LoRA pair for {target}"
                        )));
                    }
                }
            }
            if pairs.is_empty() {
                return Err(ServiceError::Adapter(format!(
                    "no LoRA weights in {}",
                    weights_path.display()
                )));
            }

            Ok(Self { config, pairs })
        }

        pub fn config(&self) -> &AdapterConfig {
            &self.config
        }

        /// Adds every low-rank delta to its base weight in place. Returns the
        /// number of merged weights; zero matches is an error.
        pub fn merge_into(&self, module: &CModule) -> Result<usize, ServiceError> {
            self.merge_into_parameters(&module.named_parameters()?)
        }

        /// Same as [`merge_into`](Self::merge_into) over an explicit parameter
        /// list. The tensors are updated through shared storage.
        pub fn merge_into_parameters(
            &self,
            parameters: &[(String, Tensor)],
        ) -> Result<usize, ServiceError> {
            let scaling = self.config.scaling();

            let merged = tch::no_grad(|| -> Result<usize, ServiceError> {
                let mut merged = 0;
                for pair in &self.pairs {
                    let Some((_, weight)) = parameters
                        .iter()
                        .find(|(name, _)| matches_parameter(name, &pair.target))
                    else {
                        warn!(target = %pair.target, "adapter weight has no base parameter");
                        continue;
                    };

                    let a = pair.a.to_device(weight.device()).f_to_kind(Kind::Float)?;
                    let b = pair.b.to_device(weight.device()).f_to_kind(Kind::Float)?;
                    let mut delta = b.f_matmul(&a)? * scaling;
                    if self.config.fan_in_fan_out {
                        delta = delta.tr();
                    }
                    if delta.size() != weight.size() {
                        return Err(ServiceError::Adapter(format!(
                            "shape mismatch for {}: delta {:?} vs weight {:?}",
                            pair.target,
                            delta.size(),
                            weight.size()
                        )));
                    }

                    let mut weight = weight.shallow_clone();
                    weight.f_add_(&delta.f_to_kind(weight.kind())?)?;
                    merged += 1;
                }
                Ok(merged)
            })?;

            if merged == 0 {
                return Err(ServiceError::Adapter(
                    "adapter matched no base model parameters".into(),
                ));
            }
            Ok(merged)
        }
    }

    #[cfg(test)]
    mod tests {
        use std::fs;

        use tch::Tensor;

        use super::*;
        use crate::model::adapter::CONFIG_FILE;

        const Q_PROJ: &str = "model.layers.0.self_attn.q_proj.weight";
        const K_PROJ: &str = "model.layers.0.self_attn.k_proj.weight";

        /// Rank-1 adapter on `q_proj` with alpha 2, so the scaling is 2.
        fn write_adapter(dir: &Path, with_b: bool) {
            fs::write(
                dir.join(CONFIG_FILE),
                r#"{"peft_type": "LORA", "r": 1, "lora_alpha": 2, "target_modules": ["q_proj"]}"#,
            )
            .unwrap();
            let a = Tensor::from_slice(&[1f32, 2., 3.]).view([1, 3]);
            let b = Tensor::from_slice(&[1f32, 2.]).view([2, 1]);
            let mut tensors = vec![(
                "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight",
                a,
            )];
            if with_b {
                tensors.push((
                    "base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight",
                    b,
                ));
            }
            Tensor::write_safetensors(&tensors, dir.join(WEIGHTS_FILE)).unwrap();
        }

        fn base_parameters() -> Vec<(String, Tensor)> {
            vec![
                (Q_PROJ.to_string(), Tensor::ones([2, 3], tch::kind::FLOAT_CPU)),
                (K_PROJ.to_string(), Tensor::ones([2, 3], tch::kind::FLOAT_CPU)),
            ]
        }

        #[test]
        fn merge_adds_scaled_low_rank_delta() {
            let dir = tempfile::tempdir().unwrap();
            write_adapter(dir.path(), true);
            let adapter = LoraAdapter::load(dir.path()).unwrap();
            assert_eq!(adapter.config().scaling(), 2.0);

            let parameters = base_parameters();
            assert_eq!(adapter.merge_into_parameters(&parameters).unwrap(), 1);

            // W + B·A·(alpha/r) with W = 1, B = [1, 2]ᵀ, A = [1, 2, 3]
            let expected = Tensor::from_slice(&[3f32, 5., 7., 5., 9., 13.]).view([2, 3]);
            assert!(parameters[0].1.allclose(&expected, 1e-6, 1e-6, false));
            let untouched = Tensor::ones([2, 3], tch::kind::FLOAT_CPU);
            assert!(parameters[1].1.allclose(&untouched, 1e-6, 1e-6, false));
        }

        #[test]
        fn incomplete_pair_is_rejected_at_load() {
            let dir = tempfile::tempdir().unwrap();
            write_adapter(dir.path(), false);
            let err = LoraAdapter::load(dir.path()).err().unwrap();
            assert!(err.to_string().contains("incomplete LoRA pair"));
        }

        #[test]
        fn shape_mismatch_and_no_match_are_errors() {
            let dir = tempfile::tempdir().unwrap();
            write_adapter(dir.path(), true);
            let adapter = LoraAdapter::load(dir.path()).unwrap();

            let wrong_shape = vec![(Q_PROJ.to_string(), Tensor::ones([3, 3], tch::kind::FLOAT_CPU))];
            let err = adapter.merge_into_parameters(&wrong_shape).unwrap_err();
            assert!(err.to_string().contains("shape mismatch"));

            let unrelated = vec![(K_PROJ.to_string(), Tensor::ones([2, 3], tch::kind::FLOAT_CPU))];
            let err = adapter.merge_into_parameters(&unrelated).unwrap_err();
            assert!(err.to_string().contains("matched no base model parameters"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peft_config() {
        let config = AdapterConfig::parse(
            r#"{
                "peft_type": "LORA",
                "r": 16,
                "lora_alpha": 32,
                "target_modules": ["q_proj", "v_proj"],
                "base_model_name_or_path": "unsloth/llama-3.1-8b-instruct-bnb-4bit",
                "task_type": "CAUSAL_LM"
            }"#,
        )
        .unwrap();
        assert_eq!(config.r, 16);
        assert_eq!(config.scaling(), 2.0);
        assert_eq!(config.target_modules, vec!["q_proj", "v_proj"]);
        assert!(!config.fan_in_fan_out);
    }

    #[test]
    fn rejects_zero_rank_and_foreign_types() {
        assert!(AdapterConfig::parse(r#"{"r": 0, "lora_alpha": 8}"#).is_err());
        assert!(
            AdapterConfig::parse(r#"{"r": 4, "lora_alpha": 8, "peft_type": "IA3"}"#).is_err()
        );
        assert!(AdapterConfig::parse("not json").is_err());
    }

    #[test]
    fn missing_config_file_is_an_adapter_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AdapterConfig::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ServiceError::Adapter(_)));

        fs::write(dir.path().join(CONFIG_FILE), r#"{"r": 8, "lora_alpha": 16}"#).unwrap();
        assert_eq!(AdapterConfig::from_dir(dir.path()).unwrap().scaling(), 2.0);
    }

    #[test]
    fn adapter_keys_map_to_base_weights() {
        assert_eq!(
            target_weight("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight"),
            Some(("model.layers.0.self_attn.q_proj.weight".into(), LoraPart::A))
        );
        assert_eq!(
            target_weight("base_model.model.model.layers.3.mlp.down_proj.lora_B.default.weight"),
            Some(("model.layers.3.mlp.down_proj.weight".into(), LoraPart::B))
        );
        assert_eq!(target_weight("base_model.model.lm_head.weight"), None);
        assert_eq!(target_weight("model.layers.0.q_proj.lora_A.bias"), None);
    }

    #[test]
    fn parameter_matching_tolerates_prefixes() {
        let target = "model.layers.0.self_attn.q_proj.weight";
        assert!(matches_parameter(target, target));
        assert!(matches_parameter("llm.model.layers.0.self_attn.q_proj.weight", target));
        assert!(matches_parameter("layers.0.self_attn.q_proj.weight", target));
        assert!(!matches_parameter("model.layers.10.self_attn.q_proj.weight", target));
    }

    #[test]
    fn bare_parameter_names_match_nothing() {
        let target = "model.layers.0.self_attn.q_proj.weight";
        assert!(!matches_parameter("weight", target));
        assert!(!matches_parameter("bias", target));
        assert!(matches_parameter("q_proj.weight", target));
    }
}
