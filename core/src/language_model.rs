//! The shared language-model capability set (spec §3) plus the top-N
//! extractor and softmax renormalizer (spec §4.6/§4.7).

use crate::error::LmError;
use crate::utf8::split_to_codepoints;
use crate::wfst::softmax_renormalize as renormalize_vec;

/// A mapping from symbol strings to probabilities, plus a normalization
/// constant. The empty string is the end-of-string sentinel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LmScores {
    pub symbols: Vec<String>,
    pub probabilities: Vec<f64>,
    pub normalization: f64,
}

impl LmScores {
    pub fn clear(&mut self) {
        self.symbols.clear();
        self.probabilities.clear();
        self.normalization = 1.0;
    }
}

/// Capability set shared by every model variant. Implemented as a trait
/// object (chosen once at hub-construction time per spec §9) rather than
/// a deep class hierarchy.
pub trait LanguageModel: Send + Sync {
    fn start_state(&self) -> i32;

    /// Number of states in this model (for the `model_state < num_states`
    /// hub invariant).
    fn num_states(&self) -> i32;

    /// The codepoint label that leads to `state`, or -1 if unknown/out of
    /// range.
    fn state_sym(&self, state: i32) -> i32;

    fn next_state(&self, state: i32, codepoint: u32) -> i32;

    /// Walks `context` one codepoint at a time from `init_state` (or
    /// `start_state()` when `init_state < 0`), resetting to the start
    /// state whenever a transition fails.
    fn context_state(&self, context: &str, init_state: i32) -> i32 {
        let mut state = if init_state < 0 {
            self.start_state()
        } else {
            init_state
        };
        for cp in split_to_codepoints(context) {
            let next = self.next_state(state, cp);
            state = if next < 0 { self.start_state() } else { next };
        }
        state
    }

    fn extract_scores(&self, state: i32, out: &mut LmScores) -> bool;

    fn sym_score(&self, state: i32, codepoint: u32) -> f64;

    fn update_counts(&self, state: i32, codepoints: &[u32], count: i64) -> bool;

    fn is_static(&self) -> bool {
        true
    }
}

/// Sorts `(probability, symbol)` pairs by probability descending (stable
/// on symbol), truncating to `top_n` when positive. Mirrors
/// `GetTopHypotheses` in the original source exactly: requesting
/// `top_n >= num_entries` is rejected, not only `top_n > num_entries`.
pub fn top_hypotheses(
    scores: &LmScores,
    top_n: i32,
) -> Result<Vec<(f64, String)>, LmError> {
    let num_entries = scores.probabilities.len();
    if num_entries != scores.symbols.len() {
        return Err(LmError::internal(format!(
            "mismatching number of probabilities ({num_entries}) and symbols ({})",
            scores.symbols.len()
        )));
    }
    if top_n >= 0 && (num_entries as i64) <= top_n as i64 {
        return Err(LmError::internal(format!(
            "too many candidates requested: {top_n}"
        )));
    } else if num_entries == 0 {
        return Err(LmError::internal("no scores to return"));
    }
    let mut hyps: Vec<(f64, String)> = scores
        .probabilities
        .iter()
        .copied()
        .zip(scores.symbols.iter().cloned())
        .collect();
    hyps.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    if top_n > 0 {
        hyps.truncate(top_n as usize);
    }
    Ok(hyps)
}

/// Negative-log-domain renormalization: `Z = NegLogSum(all)`, then
/// subtract `Z` from every element.
pub fn softmax_renormalize(neg_log_probs: &mut [f64]) {
    renormalize_vec(neg_log_probs);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(probs: &[f64], syms: &[&str]) -> LmScores {
        LmScores {
            symbols: syms.iter().map(|s| s.to_string()).collect(),
            probabilities: probs.to_vec(),
            normalization: 1.0,
        }
    }

    #[test]
    fn top_hypotheses_sorts_descending() {
        let s = scores(&[0.1, 0.7, 0.2], &["a", "b", "c"]);
        let hyps = top_hypotheses(&s, -1).unwrap();
        assert_eq!(hyps[0], (0.7, "b".to_string()));
        assert_eq!(hyps[1], (0.2, "c".to_string()));
        assert_eq!(hyps[2], (0.1, "a".to_string()));
    }

    #[test]
    fn top_hypotheses_truncates() {
        let s = scores(&[0.1, 0.7, 0.2], &["a", "b", "c"]);
        let hyps = top_hypotheses(&s, 2).unwrap();
        assert_eq!(hyps.len(), 2);
    }

    #[test]
    fn top_hypotheses_rejects_requesting_all_entries() {
        let s = scores(&[0.1, 0.9], &["a", "b"]);
        assert!(top_hypotheses(&s, 2).is_err());
    }

    #[test]
    fn top_hypotheses_rejects_empty() {
        let s = scores(&[], &[]);
        assert!(top_hypotheses(&s, -1).is_err());
    }

    #[test]
    fn top_hypotheses_rejects_length_mismatch() {
        let s = scores(&[0.5], &["a", "b"]);
        assert!(top_hypotheses(&s, -1).is_err());
    }
}
