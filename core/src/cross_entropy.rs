//! Corpus bits-per-character evaluator (spec §4.8).

use std::fs;

use crate::error::LmError;
use crate::hub::LanguageModelHub;
use crate::language_model::LmScores;
use crate::utf8::split_to_codepoints;

const NUM_CODEPOINTS: f64 = 143_859.0;
const MIX_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CorpusEvaluation {
    pub total_chars: u64,
    pub oov_chars: u64,
    pub bits_per_char: f64,
}

impl std::fmt::Display for CorpusEvaluation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Total characters: {} ({} OOV); bits per character: {}",
            self.total_chars, self.oov_chars, self.bits_per_char
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    total_chars: u64,
    oov_chars: u64,
    total_bits: f64,
}

impl Accumulator {
    fn finish(self) -> CorpusEvaluation {
        let bits_per_char = if self.total_chars == 0 {
            0.0
        } else {
            self.total_bits / self.total_chars as f64
        };
        CorpusEvaluation {
            total_chars: self.total_chars,
            oov_chars: self.oov_chars,
            bits_per_char,
        }
    }
}

/// Smooths `p_model` with a uniform-over-codepoints distribution and
/// returns `-log2` of the mix.
fn mixed_bits(p_model: f64) -> f64 {
    let mixed = MIX_EPSILON / NUM_CODEPOINTS + (1.0 - MIX_EPSILON) * p_model;
    -mixed.log2()
}

/// Scores one newline-terminated line (already split into codepoints,
/// end-of-string marker already appended) against `hub`, updating counts
/// as it goes and folding the result into `acc`.
fn evaluate_line(hub: &LanguageModelHub, codepoints: &[u32], acc: &mut Accumulator) {
    let mut state = hub.start_state();
    let mut out = LmScores::default();
    for &cp in codepoints {
        if !hub.extract_scores(state, &mut out) {
            break;
        }
        let sym = if cp == 0 {
            String::new()
        } else {
            char::from_u32(cp).map(|c| c.to_string()).unwrap_or_default()
        };
        let prob = out
            .symbols
            .iter()
            .position(|s| *s == sym)
            .map(|i| out.probabilities[i])
            .unwrap_or(0.0);
        if prob <= 0.0 {
            acc.oov_chars += 1;
        }
        acc.total_bits += mixed_bits(prob);
        acc.total_chars += 1;
        hub.update_counts(state, &[cp], 1);
        state = hub.next_state(state, cp);
    }
}

/// Reads `path` line by line, scoring each line (with a trailing
/// end-of-string symbol) against `hub`.
pub fn evaluate_corpus(hub: &LanguageModelHub, path: &str) -> Result<CorpusEvaluation, LmError> {
    let content =
        fs::read_to_string(path).map_err(|e| LmError::not_found(format!("corpus {path}: {e}")))?;
    let mut acc = Accumulator::default();
    for line in content.lines() {
        let mut codepoints = split_to_codepoints(line);
        codepoints.push(0);
        evaluate_line(hub, &codepoints, &mut acc);
    }
    Ok(acc.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MixtureType, ModelHubConfig, ModelStorage, ModelType, PpmAsFstOptions};

    fn hub_with_default_bigram() -> LanguageModelHub {
        let config = ModelHubConfig {
            mixture_type: MixtureType::None,
            models: vec![ModelStorage {
                model_type: ModelType::SimpleCharBigram,
                model_file: String::new(),
                vocabulary_file: String::new(),
                ppm_options: PpmAsFstOptions::default(),
                ngram_word_fst_options: Default::default(),
                weight: 0.0,
            }],
            bayesian_history_length: 0,
            max_hub_states: 10_000,
        };
        LanguageModelHub::new(&config).unwrap()
    }

    #[test]
    fn uniform_model_gives_positive_bits_per_character() {
        let hub = hub_with_default_bigram();
        let mut acc = Accumulator::default();
        evaluate_line(&hub, &split_to_codepoints("aaaa"), &mut acc);
        let eval = acc.finish();
        assert_eq!(eval.total_chars, 4);
        assert!(eval.bits_per_char > 0.0);
    }

    #[test]
    fn out_of_vocabulary_symbol_is_counted() {
        let hub = hub_with_default_bigram();
        let mut acc = Accumulator::default();
        // '中' is not in the default 28-symbol alphabet.
        evaluate_line(&hub, &split_to_codepoints("中"), &mut acc);
        assert_eq!(acc.oov_chars, 1);
    }

    #[test]
    fn display_format_matches_expected_shape() {
        let eval = CorpusEvaluation {
            total_chars: 10,
            oov_chars: 2,
            bits_per_char: 2.0,
        };
        assert_eq!(
            format!("{}", eval),
            "Total characters: 10 (2 OOV); bits per character: 2"
        );
    }
}
