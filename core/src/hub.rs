//! Language-model hub (spec §4.1): owns the component models as trait
//! objects, composes their distributions (Bayesian-history-weighted
//! interpolation or a single pass-through), and maintains the bounded
//! hub-state arena that maps codepoint paths onto per-model state
//! tuples.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{MixtureType, ModelHubConfig, ModelStorage, ModelType};
use crate::char_fst::CharFstModel;
use crate::error::LmError;
use crate::language_model::{LanguageModel, LmScores};
use crate::ppm_model::PpmAsFstModel;
use crate::simple_bigram::SimpleBigramCharModel;
use crate::utf8::split_to_codepoints;
use crate::wfst::{neg_log_sum, softmax_renormalize, times, ZERO};
use crate::word_fst::WordFstModel;

fn load_model(storage: &ModelStorage) -> Result<Box<dyn LanguageModel>, LmError> {
    match storage.model_type {
        ModelType::SimpleCharBigram => Ok(Box::new(SimpleBigramCharModel::read(storage)?)),
        ModelType::CharNgramFst => Ok(Box::new(CharFstModel::read(storage)?)),
        ModelType::WordNgramFst => Ok(Box::new(WordFstModel::read(storage)?)),
        ModelType::PpmAsFst => Ok(Box::new(PpmAsFstModel::read(storage)?)),
    }
}

struct HubState {
    model_states: Vec<i32>,
    prev_state: i32,
    sym: i32,
    next_states: HashMap<u32, usize>,
    bayesian_history: Vec<Vec<f64>>,
    bayesian_sum: Vec<f64>,
}

impl HubState {
    fn start(model_states: Vec<i32>, num_models: usize, history_length: usize) -> Self {
        HubState {
            model_states,
            prev_state: -1,
            sym: 0,
            next_states: HashMap::new(),
            bayesian_history: vec![Vec::new(); num_models.max(1)],
            bayesian_sum: if history_length > 0 {
                vec![0.0; num_models]
            } else {
                Vec::new()
            },
        }
    }
}

struct Arena {
    states: Vec<HubState>,
    capacity: usize,
    last_created: usize,
}

/// Composes a fixed list of component language models behind a single
/// bounded-memory interface.
pub struct LanguageModelHub {
    models: Vec<Box<dyn LanguageModel>>,
    mixture_type: MixtureType,
    base_weights: Vec<f64>,
    history_length: usize,
    arena: Mutex<Arena>,
}

impl LanguageModelHub {
    pub fn new(config: &ModelHubConfig) -> Result<Self, LmError> {
        if config.models.is_empty() {
            return Err(LmError::invalid_argument("model hub config has no models"));
        }
        let models: Vec<Box<dyn LanguageModel>> = config
            .models
            .iter()
            .map(load_model)
            .collect::<Result<_, _>>()?;

        let raw_weights: Vec<f64> = config.models.iter().map(|m| m.weight).collect();
        Ok(Self::from_models(
            models,
            config.mixture_type,
            &raw_weights,
            config.bayesian_history_length,
            config.max_hub_states,
        ))
    }

    /// Builds a hub directly from already-constructed component models,
    /// bypassing the storage-descriptor dispatch in [`Self::new`]. Used
    /// by embedders that assemble models programmatically and by tests
    /// that need deterministic fixture models.
    pub fn from_models(
        models: Vec<Box<dyn LanguageModel>>,
        mixture_type: MixtureType,
        raw_weights: &[f64],
        bayesian_history_length: i32,
        max_hub_states: i32,
    ) -> Self {
        let base_weights = normalize_weights(raw_weights.to_vec());
        let history_length = bayesian_history_length.max(0) as usize;
        let capacity = if max_hub_states < 10 {
            10_000
        } else {
            max_hub_states as usize
        };

        let start_model_states: Vec<i32> = models.iter().map(|m| m.start_state()).collect();
        let start = HubState::start(start_model_states, models.len(), history_length);

        LanguageModelHub {
            models,
            mixture_type,
            base_weights,
            history_length,
            arena: Mutex::new(Arena {
                states: vec![start],
                capacity,
                last_created: 0,
            }),
        }
    }

    pub fn start_state(&self) -> i32 {
        0
    }

    pub fn num_states(&self) -> i32 {
        self.arena.lock().unwrap().states.len() as i32
    }

    pub fn state_sym(&self, s: i32) -> i32 {
        let arena = self.arena.lock().unwrap();
        arena
            .states
            .get(s as usize)
            .map(|st| st.sym)
            .unwrap_or(-1)
    }

    fn single_effective_model(&self) -> bool {
        self.models.len() == 1 || self.mixture_type == MixtureType::None
    }

    pub fn next_state(&self, s: i32, codepoint: u32) -> i32 {
        let mut arena = self.arena.lock().unwrap();
        let s = if s < 0 || s as usize >= arena.states.len() {
            0
        } else {
            s as usize
        };
        if let Some(&next) = arena.states[s].next_states.get(&codepoint) {
            return next as i32;
        }
        let prev_model_states = arena.states[s].model_states.clone();
        let sym_probs: Vec<f64> = self
            .models
            .iter()
            .zip(prev_model_states.iter())
            .map(|(m, &ms)| m.sym_score(ms, codepoint))
            .collect();
        let next_model_states: Vec<i32> = self
            .models
            .iter()
            .zip(prev_model_states.iter())
            .map(|(m, &ms)| m.next_state(ms, codepoint))
            .collect();
        self.assign_new_hub_state(&mut arena, next_model_states, s, codepoint, &sym_probs)
            .map(|i| i as i32)
            .unwrap_or(0)
    }

    pub fn context_state(&self, text: &str, init_state: i32) -> i32 {
        let mut state = if init_state < 0 { 0 } else { init_state };
        for cp in split_to_codepoints(text) {
            let next = self.next_state(state, cp);
            state = if next < 0 { 0 } else { next };
        }
        state
    }

    fn assign_new_hub_state(
        &self,
        arena: &mut Arena,
        model_states: Vec<i32>,
        prev: usize,
        sym: u32,
        sym_probs: &[f64],
    ) -> Option<usize> {
        let (history, sums) = self.next_bayesian_history(arena, prev, sym_probs);

        let idx = if arena.states.len() < arena.capacity {
            arena.states.push(HubState {
                model_states,
                prev_state: prev as i32,
                sym: sym as i32,
                next_states: HashMap::new(),
                bayesian_history: history,
                bayesian_sum: sums,
            });
            arena.states.len() - 1
        } else {
            arena.last_created += 1;
            if arena.last_created >= arena.capacity {
                arena.last_created = 1;
                let fresh_model_states: Vec<i32> =
                    self.models.iter().map(|m| m.start_state()).collect();
                arena.states[0] = HubState::start(fresh_model_states, self.models.len(), self.history_length);
            }
            let slot = arena.last_created;
            let stale_children: Vec<usize> = arena.states[slot].next_states.values().copied().collect();
            for child in stale_children {
                if let Some(child_state) = arena.states.get_mut(child) {
                    child_state.prev_state = -1;
                }
            }
            arena.states[slot] = HubState {
                model_states,
                prev_state: prev as i32,
                sym: sym as i32,
                next_states: HashMap::new(),
                bayesian_history: history,
                bayesian_sum: sums,
            };
            slot
        };

        if let Some(parent) = arena.states.get_mut(prev) {
            parent.next_states.insert(sym, idx);
        }
        Some(idx)
    }

    fn next_bayesian_history(
        &self,
        arena: &Arena,
        prev: usize,
        sym_probs: &[f64],
    ) -> (Vec<Vec<f64>>, Vec<f64>) {
        if self.history_length == 0 {
            return (vec![Vec::new(); self.models.len()], Vec::new());
        }
        let parent = &arena.states[prev];
        let mut histories = Vec::with_capacity(self.models.len());
        let mut sums = Vec::with_capacity(self.models.len());
        for i in 0..self.models.len() {
            let mut window = vec![sym_probs[i]];
            if let Some(prev_window) = parent.bayesian_history.get(i) {
                window.extend(prev_window.iter().take(self.history_length - 1).copied());
            }
            window.truncate(self.history_length);
            let sum: f64 = window.iter().sum();
            histories.push(window);
            sums.push(sum);
        }
        (histories, sums)
    }

    fn mixture_weights(&self, arena: &Arena, s: usize) -> Vec<f64> {
        if self.single_effective_model() || self.history_length == 0 {
            return self.base_weights.clone();
        }
        let sums = &arena.states[s].bayesian_sum;
        let raw: Vec<f64> = self
            .base_weights
            .iter()
            .zip(sums.iter())
            .map(|(&w, &s)| w + s)
            .collect();
        normalize_weights(raw)
    }

    pub fn extract_scores(&self, s: i32, out: &mut LmScores) -> bool {
        let arena = self.arena.lock().unwrap();
        let s = if s < 0 || s as usize >= arena.states.len() {
            0
        } else {
            s as usize
        };
        let model_states = &arena.states[s].model_states;

        if self.single_effective_model() {
            return self.models[0].extract_scores(model_states[0], out);
        }

        let weights = self.mixture_weights(&arena, s);
        let mut sums: HashMap<String, f64> = HashMap::new();
        let mut mixed_norm = 0.0;
        for (i, model) in self.models.iter().enumerate() {
            let mut tmp = LmScores::default();
            if !model.extract_scores(model_states[i], &mut tmp) {
                continue;
            }
            mixed_norm += tmp.normalization * (-weights[i]).exp();
            for (sym, p) in tmp.symbols.iter().zip(tmp.probabilities.iter()) {
                let nlp = times(-p.ln(), weights[i]);
                sums.entry(sym.clone())
                    .and_modify(|v| *v = neg_log_sum(*v, nlp))
                    .or_insert(nlp);
            }
        }

        let mut entries: Vec<(String, f64)> = sums.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut costs: Vec<f64> = entries.iter().map(|(_, c)| *c).collect();
        softmax_renormalize(&mut costs);

        out.clear();
        for ((sym, _), cost) in entries.into_iter().zip(costs.into_iter()) {
            out.symbols.push(sym);
            out.probabilities.push((-cost).exp());
        }
        out.normalization = mixed_norm;
        true
    }

    pub fn update_counts(&self, s: i32, codepoints: &[u32], count: i64) -> bool {
        if count <= 0 {
            return true;
        }
        let start = if s < 0 { 0 } else { s as usize };

        let mut path = vec![start];
        let mut cur = start;
        for &cp in codepoints {
            let next = self.next_state(cur as i32, cp);
            if next < 0 {
                return false;
            }
            cur = next as usize;
            path.push(cur);
        }

        if self.history_length > 0 {
            let mut arena = self.arena.lock().unwrap();
            for &idx in &path[..path.len() - 1] {
                let children: Vec<(u32, usize)> = arena.states[idx]
                    .next_states
                    .iter()
                    .map(|(&sym, &child)| (sym, child))
                    .collect();
                for (sym, child) in children {
                    let parent_model_states = arena.states[idx].model_states.clone();
                    let sym_probs: Vec<f64> = self
                        .models
                        .iter()
                        .zip(parent_model_states.iter())
                        .map(|(m, &ms)| m.sym_score(ms, sym))
                        .collect();
                    let (history, sums) = self.next_bayesian_history(&arena, idx, &sym_probs);
                    if let Some(child_state) = arena.states.get_mut(child) {
                        child_state.bayesian_history = history;
                        child_state.bayesian_sum = sums;
                    }
                }
            }
        }

        {
            let arena = self.arena.lock().unwrap();
            let model_states = arena.states[start].model_states.clone();
            drop(arena);
            for (model, &ms) in self.models.iter().zip(model_states.iter()) {
                if !model.update_counts(ms, codepoints, count) {
                    return false;
                }
            }
        }

        let mut arena = self.arena.lock().unwrap();
        for (j, &cp) in codepoints.iter().enumerate() {
            let prev_idx = path[j];
            let cur_idx = path[j + 1];
            if arena.states[cur_idx].prev_state != prev_idx as i32
                || arena.states[cur_idx].sym != cp as i32
            {
                return false;
            }
            let prev_model_states = arena.states[prev_idx].model_states.clone();
            let refreshed: Vec<i32> = self
                .models
                .iter()
                .zip(prev_model_states.iter())
                .map(|(m, &ms)| m.next_state(ms, cp))
                .collect();
            arena.states[cur_idx].model_states = refreshed;
        }
        true
    }
}

fn normalize_weights(raw: Vec<f64>) -> Vec<f64> {
    if raw.len() <= 1 {
        return vec![0.0; raw.len()];
    }
    let mut z = ZERO;
    for &w in &raw {
        z = neg_log_sum(z, w);
    }
    raw.iter().map(|&w| w - z).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelStorage, PpmAsFstOptions};

    fn bigram_only_config() -> ModelHubConfig {
        ModelHubConfig {
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
        }
    }

    #[test]
    fn single_model_hub_delegates_extract_scores() {
        let hub = LanguageModelHub::new(&bigram_only_config()).unwrap();
        let mut out = LmScores::default();
        assert!(hub.extract_scores(hub.start_state(), &mut out));
        assert_eq!(out.symbols.len(), 28);
    }

    #[test]
    fn next_state_caches_child_transitions() {
        let hub = LanguageModelHub::new(&bigram_only_config()).unwrap();
        let s1 = hub.next_state(hub.start_state(), 'a' as u32);
        let s2 = hub.next_state(hub.start_state(), 'a' as u32);
        assert_eq!(s1, s2);
        assert_eq!(hub.num_states(), 2);
    }

    #[test]
    fn two_model_mixture_sums_to_one() {
        let mut config = bigram_only_config();
        config.mixture_type = MixtureType::Interpolation;
        config.models.push(ModelStorage {
            model_type: ModelType::SimpleCharBigram,
            model_file: String::new(),
            vocabulary_file: String::new(),
            ppm_options: PpmAsFstOptions::default(),
            ngram_word_fst_options: Default::default(),
            weight: 0.5,
        });
        let hub = LanguageModelHub::new(&config).unwrap();
        let mut out = LmScores::default();
        assert!(hub.extract_scores(hub.start_state(), &mut out));
        let sum: f64 = out.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn update_counts_propagates_to_component_models() {
        let hub = LanguageModelHub::new(&bigram_only_config()).unwrap();
        let a = 'a' as u32;
        assert!(hub.update_counts(hub.start_state(), &[a, a, a, a, a, a, a, a, a, a], 1));
        let mut out = LmScores::default();
        hub.extract_scores(hub.start_state(), &mut out);
        let idx = out.symbols.iter().position(|s| s == "a").unwrap();
        assert!(out.probabilities[idx] > 1.0 / 28.0);
    }

    #[test]
    fn out_of_range_state_resets_to_start() {
        let hub = LanguageModelHub::new(&bigram_only_config()).unwrap();
        assert_eq!(hub.state_sym(999), -1);
        let next = hub.next_state(999, 'a' as u32);
        assert!(next >= 0);
    }
}
