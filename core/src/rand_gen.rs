//! Inverse-CDF random text generator (spec §4.9).

use rand::Rng;

use crate::hub::LanguageModelHub;
use crate::language_model::LmScores;
use crate::utf8::split_to_codepoints;

const MAX_RAND_GEN_LEN: usize = 128;

const REACHED_LENGTH_LIMIT: &str = "(reached_length_limit)";
const SUBSEQUENT_GENERATION_FAILED: &str = "(subsequent generation failed)";

/// Draws one symbol from `scores` by inverse-CDF sampling against a
/// uniform threshold in `[0, 1)`. Walks the distribution sorted by
/// descending probability first, so the common case (a few likely
/// symbols) resolves in the fewest comparisons. Returns `None` if the
/// distribution is empty.
fn sample_symbol(scores: &LmScores, threshold: f64) -> Option<&str> {
    let mut order: Vec<usize> = (0..scores.symbols.len()).collect();
    order.sort_by(|&a, &b| {
        scores.probabilities[b]
            .partial_cmp(&scores.probabilities[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut cumulative = 0.0;
    for &i in &order {
        cumulative += scores.probabilities[i];
        if threshold < cumulative {
            return Some(scores.symbols[i].as_str());
        }
    }
    order.last().map(|&i| scores.symbols[i].as_str())
}

/// Generates random text continuing from `prefix`, stopping on an
/// empty-string draw (end-of-string), a failed extraction, or the
/// `128 + prefix_len` length cap.
pub fn generate<R: Rng + ?Sized>(hub: &LanguageModelHub, prefix: &str, rng: &mut R) -> String {
    let prefix_codepoints = split_to_codepoints(prefix);
    let max_len = MAX_RAND_GEN_LEN + prefix_codepoints.len();

    let mut state = hub.context_state(prefix, hub.start_state());
    let mut generated = String::from(prefix);
    let mut out = LmScores::default();

    loop {
        if generated.chars().count() >= max_len {
            generated.push_str(REACHED_LENGTH_LIMIT);
            break;
        }
        if !hub.extract_scores(state, &mut out) {
            generated.push_str(SUBSEQUENT_GENERATION_FAILED);
            break;
        }
        let threshold: f64 = rng.gen_range(0.0..1.0);
        let sym = match sample_symbol(&out, threshold) {
            Some(s) => s.to_string(),
            None => {
                generated.push_str(SUBSEQUENT_GENERATION_FAILED);
                break;
            }
        };
        if sym.is_empty() {
            break;
        }
        generated.push_str(&sym);
        let cp = sym.chars().next().unwrap() as u32;
        hub.update_counts(state, &[cp], 0);
        state = hub.next_state(state, cp);
    }
    generated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MixtureType, ModelHubConfig, ModelStorage, ModelType, PpmAsFstOptions};
    use rand::rngs::mock::StepRng;

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
    fn sample_symbol_walks_descending_probability_order() {
        let scores = LmScores {
            symbols: vec!["a".into(), "b".into(), "c".into()],
            probabilities: vec![0.2, 0.3, 0.5],
            normalization: 1.0,
        };
        // Descending order is c (0.5), b (0.3), a (0.2); cumulative
        // buckets are c: [0, 0.5), b: [0.5, 0.8), a: [0.8, 1.0).
        assert_eq!(sample_symbol(&scores, 0.1), Some("c"));
        assert_eq!(sample_symbol(&scores, 0.6), Some("b"));
        assert_eq!(sample_symbol(&scores, 0.9), Some("a"));
    }

    #[test]
    fn low_threshold_stream_immediately_emits_end_of_string() {
        // Default alphabet's first symbol is the empty string, so a
        // threshold of 0.0 always selects it.
        let hub = hub_with_default_bigram();
        let mut rng = StepRng::new(0, 0);
        let text = generate(&hub, "", &mut rng);
        assert_eq!(text, "");
    }

    #[test]
    fn reaching_the_length_cap_appends_the_sentinel() {
        let hub = hub_with_default_bigram();
        // A threshold just under 1.0 always lands on the last bucket,
        // which for the default alphabet is never the empty string.
        let mut rng = StepRng::new(u64::MAX - 1, 0);
        let text = generate(&hub, "", &mut rng);
        assert!(text.ends_with(REACHED_LENGTH_LIMIT));
    }
}
