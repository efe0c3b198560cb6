//! Word-level n-gram WFST served as a character stream (spec §4.3).
//! Between word boundaries the model walks an implicit trie over the
//! lexicographically sorted vocabulary; at a space character it
//! transitions back into the word-history FST.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::ModelStorage;
use crate::error::LmError;
use crate::language_model::{LanguageModel, LmScores};
use crate::utf8::encode_codepoint;
use crate::wfst::{
    load_ngram_fst, safe_neg_log_diff, softmax_renormalize, times, NGramFst,
    EPSILON_LABEL, ONE, ZERO,
};

const ASCII_SPACE: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ImplicitKey {
    explicit_state: i32,
    prefix_length: usize,
    begin: usize,
}

#[derive(Debug, Clone, Copy)]
struct ImplicitState {
    explicit_state: i32,
    prefix_length: usize,
    begin: usize,
    end: usize,
}

struct ImplicitStates {
    states: Vec<ImplicitState>,
    index: HashMap<ImplicitKey, i32>,
    base: i32,
}

impl ImplicitStates {
    fn new(base: i32) -> Self {
        ImplicitStates {
            states: Vec::new(),
            index: HashMap::new(),
            base,
        }
    }

    fn get_or_create(&mut self, explicit_state: i32, prefix_length: usize, begin: usize, end: usize) -> i32 {
        let key = ImplicitKey {
            explicit_state,
            prefix_length,
            begin,
        };
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = self.base + self.states.len() as i32;
        self.states.push(ImplicitState {
            explicit_state,
            prefix_length,
            begin,
            end,
        });
        self.index.insert(key, id);
        id
    }

    fn get(&self, id: i32) -> Option<ImplicitState> {
        let idx = (id - self.base) as usize;
        self.states.get(idx).copied()
    }
}

struct StateCache {
    vectors: HashMap<i32, Vec<f64>>,
    last_accessed: HashMap<i32, u64>,
    last_updated: HashMap<i32, u64>,
    access_counter: u64,
    max_cache_size: usize,
}

impl StateCache {
    fn new(max_cache_size: usize) -> Self {
        StateCache {
            vectors: HashMap::new(),
            last_accessed: HashMap::new(),
            last_updated: HashMap::new(),
            access_counter: 0,
            max_cache_size,
        }
    }

    fn evict_if_needed(&mut self) {
        while self.vectors.len() > self.max_cache_size {
            if let Some((&oldest, _)) = self.last_accessed.iter().min_by_key(|(_, &t)| t) {
                self.vectors.remove(&oldest);
                self.last_accessed.remove(&oldest);
                self.last_updated.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

/// Serves a character stream from a word-level n-gram WFST.
pub struct WordFstModel {
    model: NGramFst,
    total_positions: usize,
    lexicographic_order: Vec<i32>,       // position -> label
    lexicographic_position: Vec<i32>,    // label -> position, indexed by label
    previous_common_prefix_length: Vec<usize>,
    first_chars: Vec<u32>,
    first_char_ends: Vec<usize>, // last position (exclusive end) per first_chars entry
    oov_state: i32,
    implicit: Mutex<ImplicitStates>,
    cache: Mutex<StateCache>,
}

impl WordFstModel {
    pub fn read(storage: &ModelStorage) -> Result<Self, LmError> {
        let model = load_ngram_fst(storage)?;
        let max_cache_size = storage.ngram_word_fst_options.max_cache_size.max(1) as usize;
        Self::from_ngram_fst(model, max_cache_size)
    }

    fn from_ngram_fst(model: NGramFst, max_cache_size: usize) -> Result<Self, LmError> {
        let oov_label = model.syms.find("<unk>");
        let mut real: Vec<(i32, String)> = model
            .syms
            .iter()
            .filter(|&(label, _)| label != EPSILON_LABEL && Some(label) != oov_label)
            .map(|(label, s)| (label, s.to_string()))
            .collect();
        real.sort_by(|a, b| a.1.cmp(&b.1));

        let mut lexicographic_order = vec![EPSILON_LABEL];
        lexicographic_order.extend(real.iter().map(|(label, _)| *label));
        let num_real = real.len();
        if let Some(oov) = oov_label {
            lexicographic_order.push(oov);
        }
        let total_positions = lexicographic_order.len();

        let num_symbols = model.syms.num_symbols();
        let mut lexicographic_position = vec![-1i32; num_symbols];
        for (pos, &label) in lexicographic_order.iter().enumerate() {
            lexicographic_position[label as usize] = pos as i32;
        }

        let strings: Vec<&str> = lexicographic_order
            .iter()
            .map(|&label| model.syms.find_label(label).unwrap_or(""))
            .collect();

        let mut previous_common_prefix_length = vec![0usize; total_positions];
        for i in 1..total_positions {
            previous_common_prefix_length[i] = common_prefix_len(strings[i - 1], strings[i]);
        }

        // First-character groups over the real-word range [1, 1+num_real).
        let mut first_chars = Vec::new();
        let mut first_char_ends = Vec::new();
        let real_end = 1 + num_real;
        let mut i = 1;
        while i < real_end {
            let first = strings[i].chars().next().map(u32::from).unwrap_or(0);
            let mut j = i + 1;
            while j < real_end && previous_common_prefix_length[j] > 0 {
                j += 1;
            }
            first_chars.push(first);
            first_char_ends.push(j);
            i = j;
        }

        let explicit_count = model.fst.num_states() as i32;
        let mut implicit = ImplicitStates::new(explicit_count);
        let oov_state = implicit.get_or_create(-1, 1, 0, 0);

        Ok(WordFstModel {
            model,
            total_positions,
            lexicographic_order,
            lexicographic_position,
            previous_common_prefix_length,
            first_chars,
            first_char_ends,
            oov_state,
            implicit: Mutex::new(implicit),
            cache: Mutex::new(StateCache::new(max_cache_size.max(2))),
        })
    }

    fn is_explicit(&self, state: i32) -> bool {
        state >= 0 && (state as usize) < self.model.fst.num_states()
    }

    fn check_current_state(&self, state: i32) -> i32 {
        if state < 0 {
            self.model.fst.start()
        } else {
            state
        }
    }

    /// Walks the backoff chain looking for an explicit arc labeled
    /// `label`; falls back to the unigram state.
    fn next_model_state(&self, state: i32, label: i32) -> i32 {
        let mut s = state;
        loop {
            if let Some(next) = self
                .model
                .fst
                .arcs(s)
                .iter()
                .find(|a| a.ilabel == label)
                .map(|a| a.next_state)
            {
                return next;
            }
            match self.model.get_backoff(s) {
                Some((backoff_state, _)) => s = backoff_state,
                None => return self.model.unigram_state(),
            }
        }
    }

    fn get_backedoff_final_cost(&self, state: i32) -> f64 {
        let mut s = state;
        let mut acc = ONE;
        loop {
            let fw = self.model.fst.final_weight(s);
            if fw != ZERO {
                return times(fw, acc);
            }
            match self.model.get_backoff(s) {
                Some((backoff_state, backoff_weight)) => {
                    acc = times(acc, backoff_weight);
                    s = backoff_state;
                }
                None => return ZERO,
            }
        }
    }

    fn next_first_letter_state(&self, explicit_state: i32, codepoint: u32) -> i32 {
        let mut idx_found = None;
        for (idx, &fc) in self.first_chars.iter().enumerate() {
            if fc == codepoint {
                idx_found = Some(idx);
                break;
            }
        }
        let Some(idx) = idx_found else {
            return self.oov_state;
        };
        let begin = if idx == 0 { 1 } else { self.first_char_ends[idx - 1] };
        let end = self.first_char_ends[idx];
        let mut implicit = self.implicit.lock().unwrap();
        implicit.get_or_create(explicit_state, 1, begin, end)
    }

    fn word_len(&self, position: usize) -> usize {
        self.lexicographic_order
            .get(position)
            .and_then(|&label| self.model.syms.find_label(label))
            .map(|s| s.chars().count())
            .unwrap_or(0)
    }

    fn next_complete_state(&self, implicit: ImplicitState) -> i32 {
        if self.word_len(implicit.begin) == implicit.prefix_length {
            let label = self.lexicographic_order[implicit.begin];
            self.next_model_state(implicit.explicit_state, label)
        } else {
            self.model.unigram_state()
        }
    }

    fn implicit_next_state(&self, state: i32, codepoint: u32) -> i32 {
        if state == self.oov_state {
            return if codepoint == ASCII_SPACE {
                self.model.unigram_state()
            } else {
                self.oov_state
            };
        }
        let implicit = {
            let table = self.implicit.lock().unwrap();
            match table.get(state) {
                Some(s) => s,
                None => return self.oov_state,
            }
        };
        if codepoint == ASCII_SPACE {
            return self.next_complete_state(implicit);
        }
        match self.sub_range_for_char(implicit.begin, implicit.end, implicit.prefix_length, codepoint) {
            Some((b, e)) => {
                let mut table = self.implicit.lock().unwrap();
                table.get_or_create(implicit.explicit_state, implicit.prefix_length + 1, b, e)
            }
            None => self.oov_state,
        }
    }

    /// Finds the contiguous sub-range of `[begin, end)` whose symbols
    /// have `codepoint` at string index `prefix_length`. Entries sharing
    /// a longer common prefix with their predecessor are necessarily
    /// adjacent in sorted order, so one linear scan suffices.
    fn sub_range_for_char(
        &self,
        begin: usize,
        end: usize,
        prefix_length: usize,
        codepoint: u32,
    ) -> Option<(usize, usize)> {
        let mut i = begin;
        while i < end {
            let ch = self
                .lexicographic_order_str(i)
                .chars()
                .nth(prefix_length)
                .map(u32::from);
            let mut j = i + 1;
            while j < end && self.previous_common_prefix_length[j] > prefix_length {
                j += 1;
            }
            if ch == Some(codepoint) {
                return Some((i, j));
            }
            i = j;
        }
        None
    }

    fn lexicographic_order_str(&self, position: usize) -> &str {
        let label = self.lexicographic_order[position];
        self.model.syms.find_label(label).unwrap_or("")
    }

    /// Ensures `explicit_state`'s cumulative cache vector is populated,
    /// building it recursively from the backoff chain (§4.3.1).
    fn ensure_cache(&self, state: i32) -> Vec<f64> {
        {
            let mut cache = self.cache.lock().unwrap();
            cache.access_counter += 1;
            let now = cache.access_counter;
            if let Some(v) = cache.vectors.get(&state).cloned() {
                cache.last_accessed.insert(state, now);
                return v;
            }
        }
        let backoff_vec_and_weight = self.model.get_backoff(state);
        let backoff_cum = backoff_vec_and_weight.map(|(bstate, w)| (self.ensure_cache(bstate), w));

        let mut raw = vec![ZERO; self.total_positions];
        let mut set_here = vec![false; self.total_positions];

        if self.model.fst.is_final(state) {
            raw[0] = self.model.fst.final_weight(state);
            set_here[0] = true;
        }
        for arc in self.model.fst.arcs(state) {
            if arc.ilabel == EPSILON_LABEL {
                continue;
            }
            let pos = self.lexicographic_position[arc.ilabel as usize];
            if pos >= 0 {
                raw[pos as usize] = arc.weight;
                set_here[pos as usize] = true;
            }
        }

        if let Some((backoff_cum, backoff_weight)) = backoff_cum {
            for pos in 0..self.total_positions {
                if set_here[pos] {
                    continue;
                }
                let backoff_raw = if pos == 0 {
                    backoff_cum[0]
                } else {
                    safe_neg_log_diff(backoff_cum[pos], backoff_cum[pos - 1])
                };
                raw[pos] = times(backoff_weight, backoff_raw);
            }
        }

        let mut cum = vec![ZERO; self.total_positions];
        if self.total_positions > 0 {
            cum[0] = raw[0];
            let mut kahan = 0.0;
            for i in 1..self.total_positions {
                cum[i] = crate::wfst::neg_log_sum_compensated(cum[i - 1], raw[i], &mut kahan);
            }
        }

        let mut cache = self.cache.lock().unwrap();
        let now = cache.access_counter;
        cache.vectors.insert(state, cum.clone());
        cache.last_accessed.insert(state, now);
        cache.last_updated.insert(state, now);
        cache.evict_if_needed();
        cum
    }

    fn range_cost(cum: &[f64], begin: usize, end: usize) -> f64 {
        if end == 0 {
            return ZERO;
        }
        if begin == 0 {
            cum[end - 1]
        } else {
            safe_neg_log_diff(cum[end - 1], cum[begin - 1])
        }
    }

    fn extract_at_explicit(&self, state: i32, out: &mut LmScores) {
        let cum = self.ensure_cache(state);
        out.symbols.push(String::new());
        let mut costs = vec![Self::range_cost(&cum, 0, 1)];
        for (idx, &fc) in self.first_chars.iter().enumerate() {
            let begin = if idx == 0 { 1 } else { self.first_char_ends[idx - 1] };
            let end = self.first_char_ends[idx];
            out.symbols.push(encode_codepoint(fc).unwrap_or_default());
            costs.push(Self::range_cost(&cum, begin, end));
        }
        softmax_renormalize(&mut costs);
        out.probabilities = costs.iter().map(|c| (-c).exp()).collect();
        out.normalization = 1.0;
    }

    fn extract_at_implicit(&self, implicit: ImplicitState, out: &mut LmScores) {
        let cum = self.ensure_cache(implicit.explicit_state);
        let mut symbols = Vec::new();
        let mut costs = Vec::new();

        let mut pos = implicit.begin;
        // A word completing exactly at this prefix length occupies the
        // first position of the range (sort order places the shorter,
        // fully-matched word first) and becomes the synthetic "space"
        // bucket, split between continuing (space) and stopping ("").
        if self.word_len(pos) == implicit.prefix_length {
            let bucket_cost = Self::range_cost(&cum, pos, pos + 1);
            let word_label = self.lexicographic_order[pos];
            let dest = self.next_model_state(implicit.explicit_state, word_label);
            let stop_cost = self.get_backedoff_final_cost(dest);
            let continue_cost = safe_neg_log_diff(ONE, stop_cost);
            symbols.push(" ".to_string());
            costs.push(times(bucket_cost, continue_cost));
            symbols.push(String::new());
            costs.push(times(bucket_cost, stop_cost));
            pos += 1;
        }

        while pos < implicit.end {
            let ch = self
                .lexicographic_order_str(pos)
                .chars()
                .nth(implicit.prefix_length)
                .map(u32::from);
            let Some(ch) = ch else {
                pos += 1;
                continue;
            };
            let mut end = pos + 1;
            while end < implicit.end && self.previous_common_prefix_length[end] > implicit.prefix_length {
                end += 1;
            }
            symbols.push(encode_codepoint(ch).unwrap_or_default());
            costs.push(Self::range_cost(&cum, pos, end));
            pos = end;
        }

        softmax_renormalize(&mut costs);
        out.symbols = symbols;
        out.probabilities = costs.iter().map(|c| (-c).exp()).collect();
        out.normalization = 1.0;
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

impl LanguageModel for WordFstModel {
    fn start_state(&self) -> i32 {
        self.model.fst.start()
    }

    fn num_states(&self) -> i32 {
        self.model.fst.num_states() as i32 + self.implicit.lock().unwrap().states.len() as i32
    }

    fn state_sym(&self, _state: i32) -> i32 {
        -1
    }

    fn next_state(&self, state: i32, codepoint: u32) -> i32 {
        let state = self.check_current_state(state);
        if self.is_explicit(state) {
            self.next_first_letter_state(state, codepoint)
        } else {
            self.implicit_next_state(state, codepoint)
        }
    }

    fn extract_scores(&self, state: i32, out: &mut LmScores) -> bool {
        let state = self.check_current_state(state);
        out.clear();
        if self.is_explicit(state) {
            self.extract_at_explicit(state, out);
            return true;
        }
        if state == self.oov_state {
            self.extract_at_explicit(self.model.unigram_state(), out);
            return true;
        }
        let implicit = {
            let table = self.implicit.lock().unwrap();
            table.get(state)
        };
        match implicit {
            Some(implicit) => {
                self.extract_at_implicit(implicit, out);
                true
            }
            None => false,
        }
    }

    fn sym_score(&self, state: i32, codepoint: u32) -> f64 {
        let mut out = LmScores::default();
        if !self.extract_scores(state, &mut out) {
            return ZERO;
        }
        let target = encode_codepoint(codepoint).unwrap_or_default();
        out.symbols
            .iter()
            .position(|s| *s == target)
            .map(|i| -out.probabilities[i].ln())
            .unwrap_or(ZERO)
    }

    fn update_counts(&self, _state: i32, _codepoints: &[u32], _count: i64) -> bool {
        true
    }

    fn is_static(&self) -> bool {
        true
    }
}
