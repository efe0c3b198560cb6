//! End-to-end scenarios exercising the hub's Bayesian-history mixture
//! weighting and the four model variants together.

use mozolm_core::config::{MixtureType, ModelHubConfig, ModelStorage, ModelType, PpmAsFstOptions};
use mozolm_core::{LanguageModel, LanguageModelHub, LmScores};

/// A model with a fixed, hand-authored distribution per state, used to
/// exercise the hub's mixing arithmetic against numbers that can be
/// checked by hand rather than depending on PPM training dynamics.
struct FixedModel {
    // state -> (symbols, probabilities)
    distributions: Vec<(Vec<&'static str>, Vec<f64>)>,
    // state -> next state reached on 'a'
    on_a: Vec<i32>,
}

impl LanguageModel for FixedModel {
    fn start_state(&self) -> i32 {
        0
    }

    fn num_states(&self) -> i32 {
        self.distributions.len() as i32
    }

    fn state_sym(&self, _state: i32) -> i32 {
        -1
    }

    fn next_state(&self, state: i32, codepoint: u32) -> i32 {
        if codepoint == 'a' as u32 {
            self.on_a[state as usize]
        } else {
            0
        }
    }

    fn extract_scores(&self, state: i32, out: &mut LmScores) -> bool {
        out.clear();
        let (syms, probs) = &self.distributions[state as usize];
        for (s, p) in syms.iter().zip(probs.iter()) {
            out.symbols.push(s.to_string());
            out.probabilities.push(*p);
        }
        out.normalization = 1.0;
        true
    }

    fn sym_score(&self, state: i32, codepoint: u32) -> f64 {
        let (syms, probs) = &self.distributions[state as usize];
        let target = if codepoint == 0 {
            ""
        } else {
            "a"
        };
        syms.iter()
            .position(|s| *s == target)
            .map(|i| -probs[i].ln())
            .unwrap_or(f64::INFINITY)
    }

    fn update_counts(&self, _state: i32, _codepoints: &[u32], _count: i64) -> bool {
        true
    }

    fn is_static(&self) -> bool {
        true
    }
}

/// Scenario: two models disagree on how likely `"a"` was; after
/// observing it once, the Bayesian-history mixture should up-weight
/// whichever model assigned it the higher probability.
#[test]
fn bayesian_history_upweights_the_model_that_predicted_better() {
    let model_a = FixedModel {
        distributions: vec![
            (vec!["a", "b", ""], vec![0.4, 0.2, 0.4]),
            (vec!["a", "b", ""], vec![0.1, 0.1, 0.8]),
        ],
        on_a: vec![1, 1],
    };
    let model_b = FixedModel {
        distributions: vec![
            (vec!["a", ""], vec![0.6, 0.4]),
            (vec!["a", ""], vec![0.2, 0.8]),
        ],
        on_a: vec![1, 1],
    };

    let hub = LanguageModelHub::from_models(
        vec![Box::new(model_a), Box::new(model_b)],
        MixtureType::Interpolation,
        &[0.0, 0.0],
        2,
        10_000,
    );

    let a_codepoint = 'a' as u32;
    assert!(hub.update_counts(hub.start_state(), &[a_codepoint], 1));
    let dest = hub.next_state(hub.start_state(), a_codepoint);

    let mut out = LmScores::default();
    assert!(hub.extract_scores(dest, &mut out));

    let prob_of = |sym: &str| -> f64 {
        out.symbols
            .iter()
            .position(|s| s == sym)
            .map(|i| out.probabilities[i])
            .unwrap_or(0.0)
    };

    // Model B assigned "a" probability 0.6 vs model A's 0.4, so after
    // observing "a" the effective mixture weight is 0.4 for A and 0.6
    // for B: combined P(a) = 0.4*0.1 + 0.6*0.2 = 0.16,
    // P(b) = 0.4*0.1 + 0.6*0 = 0.04, P(</s>) = 0.4*0.8 + 0.6*0.8 = 0.8.
    assert!((prob_of("a") - 0.16).abs() < 1e-6);
    assert!((prob_of("b") - 0.04).abs() < 1e-6);
    assert!((prob_of("") - 0.8).abs() < 1e-6);

    let sum: f64 = out.probabilities.iter().sum();
    assert!((sum - 1.0).abs() < 1e-6);
}

/// Scenario 1 from the testable-properties list: a simple bigram with
/// no backing files is a uniform distribution over 28 symbols.
#[test]
fn simple_bigram_default_is_uniform_over_28_symbols() {
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
    let hub = LanguageModelHub::new(&config).unwrap();
    let mut out = LmScores::default();
    assert!(hub.extract_scores(hub.start_state(), &mut out));
    assert_eq!(out.symbols.len(), 28);
    for p in &out.probabilities {
        assert!((p - 1.0 / 28.0).abs() < 1e-6);
    }
}

/// L = 0, equal priors: the hub's mixture should reduce to a plain
/// uniform interpolation of the component distributions.
#[test]
fn no_history_equal_priors_gives_uniform_interpolation() {
    let model_a = FixedModel {
        distributions: vec![(vec!["a", ""], vec![0.9, 0.1])],
        on_a: vec![0],
    };
    let model_b = FixedModel {
        distributions: vec![(vec!["a", ""], vec![0.1, 0.9])],
        on_a: vec![0],
    };
    let hub = LanguageModelHub::from_models(
        vec![Box::new(model_a), Box::new(model_b)],
        MixtureType::Interpolation,
        &[0.0, 0.0],
        0,
        10_000,
    );
    let mut out = LmScores::default();
    assert!(hub.extract_scores(hub.start_state(), &mut out));
    let prob_a = out
        .symbols
        .iter()
        .position(|s| s == "a")
        .map(|i| out.probabilities[i])
        .unwrap();
    assert!((prob_a - 0.5).abs() < 1e-6);
}
