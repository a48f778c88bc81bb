use std::time::Duration;

use tokenizers::Tokenizer;

use crate::{error::ServiceError, model::SamplingParams};

/// Llama 3 end-of-turn and end-of-text markers; either one stops generation.
const STOP_TOKENS: [&str; 2] = ["<|eot_id|>", "<|end_of_text|>"];

pub trait TextCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, ServiceError>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, ServiceError>;

    fn stop_token_ids(&self) -> Vec<u32>;
}

/// Output of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// The prompt followed by the newly sampled ids.
    pub ids: Vec<u32>,
    /// Time spent producing tokens, excluding any wait for the model.
    pub elapsed: Duration,
}

/// A causal LM that extends a token sequence in place.
///
/// `generate` returns the full sequence (prompt followed by at most
/// `params.max_new_tokens` new ids), ending early once a stop id is sampled.
pub trait CausalLm: Send + Sync {
    fn generate(
        &self,
        input_ids: &[u32],
        params: &SamplingParams,
        stop_ids: &[u32],
    ) -> Result<Completion, ServiceError>;
}

impl TextCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, ServiceError> {
        // The chat template already carries <|begin_of_text|>.
        let encoding = (**self)
            .encode(text, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, ServiceError> {
        (**self)
            .decode(ids, skip_special_tokens)
            .map_err(|e| ServiceError::Decode(e.to_string()))
    }

    fn stop_token_ids(&self) -> Vec<u32> {
        STOP_TOKENS
            .iter()
            .filter_map(|token| self.token_to_id(token))
            .collect()
    }
}
