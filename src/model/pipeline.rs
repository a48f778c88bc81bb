use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use tracing::{error, info, warn};

use crate::{
    error::ServiceError,
    model::{
        GeneratedCode, GenerationDefaults, GenerationResult, LoadedModel, ModelState,
        SamplingParams, template,
    },
    monitor::ResourceMonitor,
};

/// Prompt in, code out. One call runs to completion on the calling thread.
pub struct GenerationPipeline {
    state: Arc<ModelState>,
    monitor: Arc<ResourceMonitor>,
    defaults: GenerationDefaults,
}

impl GenerationPipeline {
    pub fn new(
        state: Arc<ModelState>,
        monitor: Arc<ResourceMonitor>,
        defaults: GenerationDefaults,
    ) -> Self {
        Self {
            state,
            monitor,
            defaults,
        }
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn generate(
        &self,
        prompt: &str,
        max_tokens: Option<usize>,
        temperature: Option<f64>,
    ) -> GenerationResult {
        let Some(handles) = self.state.handles() else {
            return GenerationResult::failure(&ServiceError::ModelNotLoaded, false);
        };
        let params = self.defaults.resolve(max_tokens, temperature);

        let preview: String = prompt.chars().take(50).collect();
        info!(prompt = %preview, max_new_tokens = params.max_new_tokens, temperature = params.temperature, "generating code");

        // libtorch surfaces some failures as panics; they must not cross this boundary.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(handles, prompt, &params)))
            .unwrap_or_else(|payload| Err(ServiceError::Inference(panic_message(&payload))));

        match outcome {
            Ok(generated) => {
                info!(
                    tokens = generated.tokens_generated,
                    elapsed_ms = generated.inference_time_ms,
                    "code generated"
                );
                GenerationResult::Success(generated)
            }
            Err(err) => {
                error!(error = %err, detail = ?err, "generation failed");
                GenerationResult::failure(&err, true)
            }
        }
    }

    fn run(
        &self,
        handles: &LoadedModel,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<GeneratedCode, ServiceError> {
        let templated = template::build_prompt(prompt);

        let input_ids = handles.codec.encode(&templated)?;
        if input_ids.is_empty() {
            return Err(ServiceError::Tokenizer("prompt produced no tokens".into()));
        }
        let input_len = input_ids.len();

        let stop_ids = handles.codec.stop_token_ids();
        let completion = handles.model.generate(&input_ids, params, &stop_ids)?;
        let inference_time_ms = round2(completion.elapsed.as_secs_f64() * 1000.0);
        let output_ids = completion.ids;

        if output_ids.len() < input_len || output_ids[..input_len] != input_ids[..] {
            return Err(ServiceError::Inference(
                "model output does not extend the prompt".into(),
            ));
        }
        let tokens_generated = output_ids.len() - input_len;

        // Specials are kept so the assistant header can be located; the
        // extractor strips the remaining control tokens from the reply.
        let decoded = handles.codec.decode(&output_ids, false)?;
        let extraction = template::extract(&decoded);
        if !extraction.marker_found {
            warn!("assistant marker missing from decoded output, returning full text");
        }

        Ok(GeneratedCode {
            code: extraction.code,
            tokens_generated,
            inference_time_ms,
            model_loaded: true,
            gpu_memory: self.monitor.snapshot(),
        })
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "inference panicked".to_string()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::model::{CausalLm, Completion, ComputeDevice, TextCodec};

    const EOS: u32 = 0;

    /// One token per char, code point as id.
    struct CharCodec {
        encodes: Arc<AtomicUsize>,
    }

    impl TextCodec for CharCodec {
        fn encode(&self, text: &str) -> Result<Vec<u32>, ServiceError> {
            self.encodes.fetch_add(1, Ordering::SeqCst);
            Ok(text.chars().map(|c| c as u32).collect())
        }

        fn decode(&self, ids: &[u32], _skip_special: bool) -> Result<String, ServiceError> {
            Ok(ids
                .iter()
                .filter(|&&id| id != EOS)
                .filter_map(|&id| char::from_u32(id))
                .collect())
        }

        fn stop_token_ids(&self) -> Vec<u32> {
            vec![EOS]
        }
    }

    enum Script {
        Reply(&'static str),
        Fail,
        Panic,
        Truncate,
    }

    struct ScriptedLm {
        script: Script,
        calls: Arc<AtomicUsize>,
    }

    /// Every scripted call reports this much model time.
    const MODEL_TIME: Duration = Duration::from_millis(1234);

    impl CausalLm for ScriptedLm {
        fn generate(
            &self,
            input_ids: &[u32],
            params: &SamplingParams,
            stop_ids: &[u32],
        ) -> Result<Completion, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let ids = match self.script {
                Script::Reply(reply) => {
                    let mut ids = input_ids.to_vec();
                    let new = reply.chars().map(|c| c as u32).chain(stop_ids.iter().copied());
                    ids.extend(new.take(params.max_new_tokens));
                    ids
                }
                Script::Fail => return Err(ServiceError::Inference("CUDA out of memory".into())),
                Script::Panic => panic!("tensor shape mismatch"),
                Script::Truncate => input_ids[..1].to_vec(),
            };
            Ok(Completion {
                ids,
                elapsed: MODEL_TIME,
            })
        }
    }

    struct Harness {
        pipeline: GenerationPipeline,
        encodes: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    fn harness(script: Script, loaded: bool) -> Harness {
        let encodes = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let state = if loaded {
            ModelState::loaded(
                ComputeDevice::Cpu,
                LoadedModel {
                    model: Arc::new(ScriptedLm {
                        script,
                        calls: calls.clone(),
                    }),
                    codec: Arc::new(CharCodec {
                        encodes: encodes.clone(),
                    }),
                    metadata: None,
                },
            )
        } else {
            ModelState::unloaded(ComputeDevice::Cpu)
        };
        let pipeline = GenerationPipeline::new(
            Arc::new(state),
            Arc::new(ResourceMonitor::cpu_only()),
            GenerationDefaults {
                max_tokens: 512,
                temperature: 0.7,
                top_p: 0.9,
            },
        );
        Harness {
            pipeline,
            encodes,
            calls,
        }
    }

    #[test]
    fn unloaded_model_fails_without_touching_backend() {
        let h = harness(Script::Reply("unused"), false);
        let result = h.pipeline.generate("write a sort", None, None);

        assert!(!result.is_success());
        assert_eq!(result.error(), Some("model not loaded"));
        assert_eq!(h.encodes.load(Ordering::SeqCst), 0);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn adds_two_numbers_scenario() {
        let h = harness(
            Script::Reply("```python\ndef add(a, b):\n    return a + b\n```"),
            true,
        );
        let result = h
            .pipeline
            .generate("write a function that adds two numbers", Some(50), Some(0.2));

        let GenerationResult::Success(out) = result else {
            panic!("expected success, got {result:?}");
        };
        assert_eq!(out.code, "def add(a, b):\n    return a + b");
        assert!(out.tokens_generated <= 50);
        assert!(out.inference_time_ms >= 0.0);
        assert!(out.model_loaded);
    }

    #[test]
    fn inference_time_is_the_model_reported_duration() {
        let h = harness(Script::Reply("pass"), true);
        let GenerationResult::Success(out) = h.pipeline.generate("noop", None, None) else {
            panic!("expected success");
        };
        assert_eq!(out.inference_time_ms, 1234.0);
    }

    #[test]
    fn token_budget_bounds_generation() {
        let h = harness(Script::Reply("x = 1\ny = 2\nz = 3\n"), true);
        let GenerationResult::Success(out) = h.pipeline.generate("vars", Some(5), None) else {
            panic!("expected success");
        };
        assert_eq!(out.tokens_generated, 5);
        assert_eq!(out.code, "x = 1");
    }

    #[test]
    fn unfenced_reply_is_returned_whole() {
        let h = harness(Script::Reply("print('hi')"), true);
        let GenerationResult::Success(out) = h.pipeline.generate("greet", None, None) else {
            panic!("expected success");
        };
        assert_eq!(out.code, "print('hi')");
        // reply chars plus the stop token
        assert_eq!(out.tokens_generated, "print('hi')".chars().count() + 1);
    }

    #[test]
    fn backend_errors_become_failure_results() {
        let h = harness(Script::Fail, true);
        let result = h.pipeline.generate("anything", None, None);
        assert!(!result.is_success());
        assert!(result.error().unwrap().contains("out of memory"));
        assert!(h.pipeline.state().is_loaded());
    }

    #[test]
    fn panics_are_contained() {
        let h = harness(Script::Panic, true);
        let result = h.pipeline.generate("anything", None, None);
        assert!(result.error().unwrap().contains("tensor shape mismatch"));
    }

    #[test]
    fn output_shorter_than_prompt_is_rejected() {
        let h = harness(Script::Truncate, true);
        let result = h.pipeline.generate("anything", None, None);
        assert!(result.error().unwrap().contains("does not extend the prompt"));
    }
}
