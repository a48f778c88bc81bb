use std::time::Instant;

use parking_lot::Mutex;
use tch::{CModule, Device, IValue, Tensor, no_grad};

use crate::{
    error::ServiceError,
    model::{CausalLm, Completion, ComputeDevice, SamplingParams, sampling::sample_next_token},
};

/// TorchScript causal LM with its LoRA adapter already merged.
pub struct TorchCausalLm {
    device: ComputeDevice,
    module: Mutex<CModule>,
}

impl TorchCausalLm {
    pub fn new(module: CModule, device: ComputeDevice) -> Self {
        Self {
            device,
            module: Mutex::new(module),
        }
    }

    fn torch_device(&self) -> Device {
        to_torch_device(self.device)
    }
}

pub fn to_torch_device(device: ComputeDevice) -> Device {
    match device {
        ComputeDevice::Cpu => Device::Cpu,
        ComputeDevice::Cuda(idx) => Device::Cuda(idx),
    }
}

impl CausalLm for TorchCausalLm {
    fn generate(
        &self,
        input_ids: &[u32],
        params: &SamplingParams,
        stop_ids: &[u32],
    ) -> Result<Completion, ServiceError> {
        let mut ids: Vec<i64> = input_ids.iter().map(|&id| id as i64).collect();
        let device = self.torch_device();

        let elapsed = no_grad(|| {
            let module = self.module.lock();
            let started = Instant::now();

            for _ in 0..params.max_new_tokens {
                let input = Tensor::from_slice(&ids)
                    .f_reshape([1, ids.len() as i64])?
                    .to_device(device);

                let output = module.forward_is(&[IValue::Tensor(input)])?;

                // Traced HF models return either bare logits or (logits, past, ...).
                let logits = match output {
                    IValue::Tensor(t) => t,
                    IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                        IValue::Tensor(t) => t.shallow_clone(),
                        _ => {
                            return Err(ServiceError::Inference(
                                "expected tensor as first tuple element".into(),
                            ));
                        }
                    },
                    _ => {
                        return Err(ServiceError::Inference(
                            "unexpected model output format".into(),
                        ));
                    }
                };

                // [1, seq_len, vocab] -> [vocab]
                let last_logits = logits.f_select(1, -1)?.f_squeeze_dim(0)?;
                let next = sample_next_token(&last_logits, params.temperature, params.top_p)?;

                ids.push(next);
                if u32::try_from(next).is_ok_and(|id| stop_ids.contains(&id)) {
                    break;
                }
            }

            Ok::<_, ServiceError>(started.elapsed())
        })?;

        let ids = ids
            .into_iter()
            .map(|id| {
                u32::try_from(id)
                    .map_err(|_| ServiceError::Inference(format!("sampled invalid token id {id}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Completion { ids, elapsed })
    }
}

#[cfg(test)]
mod tests {
    use tch::Kind;

    use super::*;

    const VOCAB: i64 = 32;

    /// Traced stand-in for a causal LM: the logits at every position put all
    /// their mass on `id + 1`, so greedy decoding counts upwards.
    fn counting_lm() -> TorchCausalLm {
        let example = Tensor::from_slice(&[1i64, 2, 3]).view([1, 3]);
        let module = CModule::create_by_tracing(
            "CountingLm",
            "forward",
            &[example],
            &mut |inputs: &[Tensor]| {
                vec![inputs[0].add_scalar(1).one_hot(VOCAB).to_kind(Kind::Float)]
            },
        )
        .unwrap();
        TorchCausalLm::new(module, ComputeDevice::Cpu)
    }

    fn greedy(max_new_tokens: usize) -> SamplingParams {
        SamplingParams {
            max_new_tokens,
            temperature: 0.0,
            top_p: 0.9,
        }
    }

    #[test]
    fn generation_extends_the_prompt_and_stops_on_stop_id() {
        let lm = counting_lm();
        let out = lm.generate(&[1, 2, 3], &greedy(20), &[6]).unwrap();
        assert_eq!(out.ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn generation_never_exceeds_the_token_budget() {
        let lm = counting_lm();
        for budget in [0, 1, 4] {
            let out = lm.generate(&[1, 2, 3], &greedy(budget), &[]).unwrap();
            assert_eq!(out.ids.len(), 3 + budget);
            assert_eq!(&out.ids[..3], &[1, 2, 3]);
        }
    }
}
