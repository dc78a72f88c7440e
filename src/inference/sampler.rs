//! Token selection
//!
//! [`Sampler`] reduces one logits row to the next token id. Only greedy
//! argmax ships; stochastic policies plug in behind the same trait.

use crate::inference::ffi::llama_token;

/// Picks the next token from a logits row (one score per vocabulary entry).
pub trait Sampler: Send {
    /// `None` when no token can be chosen (empty row).
    fn sample(&mut self, logits: &[f32]) -> Option<llama_token>;
}

/// Deterministic argmax.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greedy;

impl Sampler for Greedy {
    fn sample(&mut self, logits: &[f32]) -> Option<llama_token> {
        sample_greedy(logits)
    }
}

/// Index of the largest logit by linear scan.
///
/// Ties resolve to the lowest index. NaN never wins; a row with no comparable
/// value resolves to index 0.
pub fn sample_greedy(logits: &[f32]) -> Option<llama_token> {
    if logits.is_empty() {
        return None;
    }

    let mut best = 0;
    let mut best_logit = f32::NEG_INFINITY;
    for (i, &logit) in logits.iter().enumerate() {
        if logit > best_logit {
            best = i;
            best_logit = logit;
        }
    }

    llama_token::try_from(best).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_maximum_wins() {
        assert_eq!(sample_greedy(&[1.0, 1.0, 0.5]), Some(0));
        assert_eq!(sample_greedy(&[0.1, 3.0, 3.0, 2.0]), Some(1));
    }

    #[test]
    fn test_deterministic() {
        let logits = [0.3, -1.2, 4.5, 4.4, 0.0];
        let first = sample_greedy(&logits);
        let second = sample_greedy(&logits);
        assert_eq!(first, Some(2));
        assert_eq!(first, second);
    }

    #[test]
    fn test_negative_scores() {
        assert_eq!(sample_greedy(&[-5.0, -0.5, -2.0]), Some(1));
    }

    #[test]
    fn test_nan_is_skipped() {
        assert_eq!(sample_greedy(&[f32::NAN, 0.5, 0.2]), Some(1));
        assert_eq!(sample_greedy(&[f32::NAN, f32::NAN]), Some(0));
    }

    #[test]
    fn test_empty_row() {
        assert_eq!(sample_greedy(&[]), None);
    }

    #[test]
    fn test_greedy_sampler_matches_function() {
        let mut sampler = Greedy;
        let logits = [0.0, 0.0, 9.0];
        assert_eq!(sampler.sample(&logits), sample_greedy(&logits));
    }
}
