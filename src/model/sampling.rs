use tch::{Kind, TchError, Tensor};

/// Picks the next token id from last-position logits of shape `[vocab]`.
///
/// Temperature 0 is greedy. Otherwise the distribution is temperature
/// scaled and truncated to the smallest prefix (by descending probability)
/// whose mass reaches `top_p`; the most likely token is always kept.
pub fn sample_next_token(logits: &Tensor, temperature: f64, top_p: f64) -> Result<i64, TchError> {
    let logits = logits.f_to_kind(Kind::Float)?;
    if temperature <= f64::EPSILON {
        return logits.f_argmax(-1, false)?.f_int64_value(&[]);
    }

    let probs = (logits / temperature).f_softmax(-1, Kind::Float)?;
    let (sorted, indices) = probs.f_sort(-1, true)?;
    let cumulative = sorted.f_cumsum(-1, Kind::Float)?;
    // Mass strictly before each candidate; once that reaches top_p the candidate is dropped.
    let excluded = (&cumulative - &sorted).f_ge(top_p)?;
    let kept = sorted.f_masked_fill(&excluded, 0.0)?;

    let choice = kept.f_multinomial(1, false)?;
    indices.f_gather(-1, &choice, false)?.f_int64_value(&[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits() -> Tensor {
        Tensor::from_slice(&[0.1f32, 4.0, 0.5, 3.9, -2.0])
    }

    #[test]
    fn zero_temperature_is_greedy() {
        for _ in 0..5 {
            assert_eq!(sample_next_token(&logits(), 0.0, 0.9).unwrap(), 1);
        }
    }

    #[test]
    fn tiny_top_p_keeps_only_the_best_token() {
        tch::manual_seed(7);
        for _ in 0..20 {
            assert_eq!(sample_next_token(&logits(), 1.0, 1e-6).unwrap(), 1);
        }
    }

    #[test]
    fn nucleus_excludes_the_tail() {
        tch::manual_seed(11);
        // Ids 1 and 3 hold nearly all the mass at low temperature.
        for _ in 0..50 {
            let id = sample_next_token(&logits(), 0.5, 0.9).unwrap();
            assert!(id == 1 || id == 3, "sampled tail token {id}");
        }
    }

    #[test]
    fn half_precision_logits_are_accepted() {
        let half = logits().to_kind(Kind::Half);
        assert_eq!(sample_next_token(&half, 0.0, 0.9).unwrap(), 1);
    }
}
