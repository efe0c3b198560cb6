//! Adaptive PPM-as-FST model (spec §4.2): blended PPM (Steinruecken,
//! Ghahramani & MacKay 2015) with update-exclusion (Moffat 1990). Counts
//! live on the arcs of a backoff WFST in negative-log form; a single
//! mutex protects the whole structure since even read-only extraction
//! fills and mutates the per-state probability cache.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::ModelStorage;
use crate::error::LmError;
use crate::language_model::{LanguageModel, LmScores};
use crate::utf8::{encode_codepoint, split_to_codepoints};
use crate::wfst::{
    neg_log_sum, safe_neg_log_diff, softmax_renormalize, times, Arc, SymbolTable, VectorFst,
    EPSILON_LABEL, ZERO,
};

struct CacheEntry {
    origin: Vec<i32>,
    destination: Vec<i32>,
    neg_log_probs: Vec<f64>,
    last_updated: u64,
}

struct Inner {
    fst: VectorFst,
    syms: SymbolTable,
    unigram_state: i32,
    start_state: i32,
    /// Raw (not negative-log) total count per state; the denominator
    /// `c(h)` of the PPM formula. Kept as a side table rather than
    /// overloading the backoff arc's weight field.
    total_count: Vec<f64>,
    state_orders: Vec<i32>,
    cache: HashMap<i32, CacheEntry>,
    access_counter: u64,
    max_cache_size: usize,
}

pub struct PpmAsFstModel {
    inner: Mutex<Inner>,
    alpha: f64,
    beta: f64,
    max_order: i32,
    static_model: bool,
}

impl PpmAsFstModel {
    pub fn read(storage: &ModelStorage) -> Result<Self, LmError> {
        let opts = &storage.ppm_options;
        let (fst, syms, unigram_state, start_state) = if opts.model_is_fst
            && !storage.model_file.is_empty()
        {
            let bytes = std::fs::read(&storage.model_file)
                .map_err(|e| LmError::not_found(format!("ppm model file: {e}")))?;
            let (fst, syms): (VectorFst, SymbolTable) = bincode::deserialize(&bytes)
                .map_err(|e| LmError::not_found(format!("bad ppm FST payload: {e}")))?;
            let start = fst.start();
            let unigram = walk_to_unigram(&fst, start);
            (fst, syms, unigram, start)
        } else if !storage.model_file.is_empty() {
            let text = std::fs::read_to_string(&storage.model_file)
                .map_err(|e| LmError::not_found(format!("ppm training corpus: {e}")))?;
            let mut syms = SymbolTable::new();
            let lines: Vec<&str> = text.lines().collect();
            if !storage.vocabulary_file.is_empty() {
                seed_vocab(&mut syms, &storage.vocabulary_file)?;
            }
            let (mut fst, unigram, start) =
                build_from_corpus(&lines, opts.max_order, &mut syms);
            apply_update_exclusion(&mut fst, unigram, start);
            (fst, syms, unigram, start)
        } else if !storage.vocabulary_file.is_empty() {
            let mut syms = SymbolTable::new();
            seed_vocab(&mut syms, &storage.vocabulary_file)?;
            let mut fst = VectorFst::new();
            let unigram = fst.add_state();
            let start = fst.add_state();
            fst.set_start(start);
            fst.add_arc(
                start,
                Arc {
                    ilabel: EPSILON_LABEL,
                    weight: 0.0,
                    next_state: unigram,
                },
            );
            (fst, syms, unigram, start)
        } else {
            return Err(LmError::not_found(
                "ppm model requires model_file or vocabulary_file",
            ));
        };

        let max_cache_size =
            (opts.max_cache_size.max(1) as usize).max(opts.max_order as usize + 1);
        let mut inner = Inner {
            fst,
            syms,
            unigram_state,
            start_state,
            total_count: Vec::new(),
            state_orders: Vec::new(),
            cache: HashMap::new(),
            access_counter: 0,
            max_cache_size,
        };
        add_prior_counts(&mut inner, unigram_state);
        finalize_counts(&mut inner);
        if !opts.static_model {
            compute_state_orders(&mut inner);
        }

        Ok(PpmAsFstModel {
            inner: Mutex::new(inner),
            alpha: opts.alpha,
            beta: opts.beta,
            max_order: opts.max_order,
            static_model: opts.static_model,
        })
    }

    fn ensure_cache(inner: &mut Inner, alpha: f64, beta: f64, state: i32) {
        inner.access_counter += 1;
        let now = inner.access_counter;

        let backoff_state = inner.fst.backoff(state).map(|(b, _)| b);
        if let Some(b) = backoff_state {
            // Recurse unconditionally, not just when uncached: a cached
            // backoff entry can itself be stale relative to its own
            // ancestor, and only recursing refreshes the whole chain.
            Self::ensure_cache(inner, alpha, beta, b);
        }

        let up_to_date = inner
            .cache
            .get(&state)
            .map(|e| {
                backoff_state
                    .and_then(|b| inner.cache.get(&b))
                    .map(|be| be.last_updated <= e.last_updated)
                    .unwrap_or(true)
            })
            .unwrap_or(false);
        if up_to_date {
            return;
        }

        let n = inner.syms.num_symbols();
        let c_s = inner.total_count[state as usize];
        let d = neg_log_sum(-c_s.max(1e-300).ln(), -alpha.ln());

        let mut origin = vec![-1i32; n];
        let mut destination = vec![-1i32; n];
        let mut probs = vec![ZERO; n];

        if let Some(b) = backoff_state {
            let num_distinct = inner.fst.num_arcs(state).saturating_sub(1) as f64;
            let gamma = neg_log_sum(-(num_distinct * beta).max(1e-300).ln(), -alpha.ln()) - d;
            let b_entry = inner.cache.get(&b).expect("backoff cached above");
            origin = b_entry.origin.clone();
            destination = b_entry.destination.clone();
            for i in 0..n {
                if b_entry.neg_log_probs[i] != ZERO {
                    probs[i] = times(gamma, b_entry.neg_log_probs[i]);
                }
            }
            for arc in inner.fst.arcs(state) {
                if arc.ilabel == EPSILON_LABEL {
                    continue;
                }
                let i = arc.ilabel as usize;
                let own_prob = safe_neg_log_diff(arc.weight, -beta.ln()) - d;
                probs[i] = neg_log_sum(probs[i], own_prob);
                origin[i] = state;
                destination[i] = arc.next_state;
            }
            if inner.fst.is_final(state) {
                let fw = inner.fst.final_weight(state);
                if fw != ZERO {
                    let own_prob = safe_neg_log_diff(fw, -beta.ln()) - d;
                    probs[0] = neg_log_sum(probs[0], own_prob);
                    origin[0] = state;
                    destination[0] = state;
                }
            }
        } else {
            for arc in inner.fst.arcs(state) {
                if arc.ilabel == EPSILON_LABEL {
                    continue;
                }
                let i = arc.ilabel as usize;
                probs[i] = arc.weight - d;
                origin[i] = state;
                destination[i] = arc.next_state;
            }
            if inner.fst.is_final(state) {
                let fw = inner.fst.final_weight(state);
                if fw != ZERO {
                    probs[0] = fw - d;
                    origin[0] = state;
                    destination[0] = state;
                }
            }
        }

        softmax_renormalize(&mut probs);
        inner.cache.insert(
            state,
            CacheEntry {
                origin,
                destination,
                neg_log_probs: probs,
                last_updated: now,
            },
        );
        let max_cache_size = inner.max_cache_size;
        Self::evict_if_needed(inner, max_cache_size);
    }

    fn evict_if_needed(inner: &mut Inner, max_cache_size: usize) {
        while inner.cache.len() > max_cache_size {
            if let Some((&oldest, _)) = inner.cache.iter().min_by_key(|(_, e)| e.last_updated) {
                inner.cache.remove(&oldest);
            } else {
                break;
            }
        }
    }

    fn sym_index(inner: &Inner, codepoint: u32) -> Option<i32> {
        let s = encode_codepoint(codepoint).ok()?;
        inner.syms.find(&s)
    }

    fn update_model(
        inner: &mut Inner,
        alpha: f64,
        beta: f64,
        max_order: i32,
        state: i32,
        highest_found: i32,
        dest_hint: i32,
        label: i32,
    ) -> i32 {
        let has_backoff = inner.fst.backoff(state).is_some();
        if let Some((backoff_state, _)) = inner.fst.backoff(state) {
            let has_continuations = inner.fst.num_arcs(state) > 1 || inner.fst.is_final(state);
            if has_continuations {
                inner.total_count[state as usize] += 1.0;
            }
            if highest_found != state {
                Self::update_model(inner, alpha, beta, max_order, backoff_state, highest_found, dest_hint, label);
            }
        }

        let order = inner.state_orders.get(state as usize).copied().unwrap_or(1);
        let result_state;
        if highest_found == state {
            if label == EPSILON_LABEL {
                let fw = inner.fst.final_weight(state);
                inner.fst.set_final(state, neg_log_sum(fw, 0.0));
                result_state = state;
            } else if order >= max_order {
                let old_dest = inner
                    .fst
                    .arcs(state)
                    .iter()
                    .find(|a| a.ilabel == label)
                    .map(|a| a.next_state);
                let new_state = inner.fst.add_state();
                inner.state_orders.push(order);
                inner.total_count.push(0.0);
                if let Some(old) = old_dest {
                    inner.fst.add_arc(
                        new_state,
                        Arc {
                            ilabel: EPSILON_LABEL,
                            weight: 0.0,
                            next_state: old,
                        },
                    );
                }
                if let Some(arc) = inner
                    .fst
                    .arcs_mut(state)
                    .iter_mut()
                    .find(|a| a.ilabel == label)
                {
                    arc.weight = neg_log_sum(arc.weight, 0.0);
                    arc.next_state = new_state;
                }
                result_state = new_state;
            } else {
                let mut next_state = state;
                if let Some(arc) = inner
                    .fst
                    .arcs_mut(state)
                    .iter_mut()
                    .find(|a| a.ilabel == label)
                {
                    arc.weight = neg_log_sum(arc.weight, 0.0);
                    next_state = arc.next_state;
                }
                result_state = next_state;
            }
        } else {
            let dest = if dest_hint >= 0 { dest_hint } else { inner.unigram_state };
            let target = if order + 1 > max_order {
                let new_state = inner.fst.add_state();
                inner.state_orders.push(order + 1);
                inner.total_count.push(0.0);
                inner.fst.add_arc(
                    new_state,
                    Arc {
                        ilabel: EPSILON_LABEL,
                        weight: 0.0,
                        next_state: dest,
                    },
                );
                new_state
            } else {
                dest
            };
            inner.fst.add_arc(
                state,
                Arc {
                    ilabel: label,
                    weight: 0.0,
                    next_state: target,
                },
            );
            result_state = target;
        }

        if !has_backoff {
            inner.total_count[state as usize] += 1.0;
        }
        Self::ensure_cache_stale(inner, state);
        Self::ensure_cache(inner, alpha, beta, state);
        result_state
    }

    fn ensure_cache_stale(inner: &mut Inner, state: i32) {
        inner.cache.remove(&state);
    }
}

fn walk_to_unigram(fst: &VectorFst, start: i32) -> i32 {
    let mut s = start;
    loop {
        match fst.backoff(s) {
            Some((next, _)) => s = next,
            None => return s,
        }
    }
}

fn seed_vocab(syms: &mut SymbolTable, vocabulary_file: &str) -> Result<(), LmError> {
    let content = std::fs::read_to_string(vocabulary_file)
        .map_err(|e| LmError::not_found(format!("vocabulary file: {e}")))?;
    for line in content.lines() {
        let line = line.trim();
        if !line.is_empty() {
            syms.add_symbol(line);
        }
    }
    Ok(())
}

/// Builds the raw-count backoff FST from a text corpus: for each line
/// and each position, increments the arc (or final weight, at line end)
/// reachable from every context length `0..max_order-1` ending there.
fn build_from_corpus(lines: &[&str], max_order: i32, syms: &mut SymbolTable) -> (VectorFst, i32, i32) {
    let max_order = max_order.max(1);
    let mut fst = VectorFst::new();
    let unigram_state = fst.add_state();
    let start_state = fst.add_state();
    fst.set_start(start_state);
    fst.add_arc(
        start_state,
        Arc {
            ilabel: EPSILON_LABEL,
            weight: 0.0,
            next_state: unigram_state,
        },
    );

    let mut context_states: HashMap<Vec<u32>, i32> = HashMap::new();
    context_states.insert(Vec::new(), start_state);

    fn get_or_create(
        fst: &mut VectorFst,
        context_states: &mut HashMap<Vec<u32>, i32>,
        unigram_state: i32,
        context: &[u32],
    ) -> i32 {
        if let Some(&s) = context_states.get(context) {
            return s;
        }
        let suffix = &context[1..];
        let backoff_target = get_or_create(fst, context_states, unigram_state, suffix);
        let s = fst.add_state();
        fst.add_arc(
            s,
            Arc {
                ilabel: EPSILON_LABEL,
                weight: 0.0,
                next_state: backoff_target,
            },
        );
        context_states.insert(context.to_vec(), s);
        s
    }

    for line in lines {
        let cps = split_to_codepoints(line);
        let n = cps.len();
        for i in 0..=n {
            let max_len = (max_order - 1).max(0) as usize;
            for order_len in 0..=max_len.min(i) {
                let context = &cps[i - order_len..i];
                let state = get_or_create(&mut fst, &mut context_states, unigram_state, context);
                if i == n {
                    let fw = fst.final_weight(state);
                    fst.set_final(state, if fw == ZERO { 0.0 } else { fw } + 1.0);
                } else {
                    let label = syms.add_symbol(&encode_codepoint(cps[i]).unwrap_or_default());
                    let existing = fst
                        .arcs_mut(state)
                        .iter_mut()
                        .find(|a| a.ilabel == label);
                    match existing {
                        Some(a) => a.weight += 1.0,
                        None => {
                            fst.add_arc(
                                state,
                                Arc {
                                    ilabel: label,
                                    weight: 1.0,
                                    next_state: unigram_state,
                                },
                            );
                        }
                    }
                }
            }
        }
    }

    (fst, unigram_state, start_state)
}

/// Moffat 1990 update-exclusion: every state with an observed arc
/// contributes a single type-count increment to its backoff target,
/// counting distinct higher-order continuations rather than raw
/// frequency.
fn apply_update_exclusion(fst: &mut VectorFst, unigram_state: i32, _start_state: i32) {
    let num_states = fst.num_states() as i32;
    let mut is_target = vec![false; num_states as usize];
    is_target[unigram_state as usize] = true;
    for s in 0..num_states {
        if let Some((b, _)) = fst.backoff(s) {
            is_target[b as usize] = true;
        }
    }
    for s in 0..num_states {
        if is_target[s as usize] {
            for arc in fst.arcs_mut(s) {
                if arc.ilabel != EPSILON_LABEL {
                    arc.weight = 0.0;
                }
            }
            fst.set_final(s, 0.0);
        }
    }

    let snapshot: Vec<(Vec<(i32, i32)>, bool)> = (0..num_states)
        .map(|s| {
            let labels: Vec<(i32, i32)> = fst
                .arcs(s)
                .iter()
                .filter(|a| a.ilabel != EPSILON_LABEL)
                .map(|a| (a.ilabel, a.next_state))
                .collect();
            (labels, fst.is_final(s))
        })
        .collect();

    for s in 0..num_states {
        let Some((b, _)) = fst.backoff(s) else { continue };
        let (labels, is_final) = &snapshot[s as usize];
        for &(label, dest) in labels {
            let arc = fst.arcs_mut(b).iter_mut().find(|a| a.ilabel == label);
            match arc {
                Some(a) => a.weight += 1.0,
                None => {
                    fst.add_arc(
                        b,
                        Arc {
                            ilabel: label,
                            weight: 1.0,
                            next_state: dest,
                        },
                    );
                }
            }
        }
        if *is_final {
            let fw = fst.final_weight(b);
            fst.set_final(b, if fw == ZERO { 0.0 } else { fw } + 1.0);
        }
    }
}

/// Adds Laplace +1 prior counts at the unigram state and ensures every
/// vocabulary symbol has a unigram arc.
fn add_prior_counts(inner: &mut Inner, unigram_state: i32) {
    for label in 1..inner.syms.num_symbols() as i32 {
        let has_arc = inner
            .fst
            .arcs(unigram_state)
            .iter()
            .any(|a| a.ilabel == label);
        if !has_arc {
            inner.fst.add_arc(
                unigram_state,
                Arc {
                    ilabel: label,
                    weight: 0.0,
                    next_state: unigram_state,
                },
            );
        }
    }
    for arc in inner.fst.arcs_mut(unigram_state) {
        if arc.ilabel != EPSILON_LABEL {
            arc.weight += 1.0;
        }
    }
    let fw = inner.fst.final_weight(unigram_state);
    inner
        .fst
        .set_final(unigram_state, if fw == ZERO { 0.0 } else { fw } + 1.0);
    inner.fst.sort_all_arcs();
}

/// Computes each state's raw total count (arcs + final), then converts
/// every weight in the FST to negative-log form.
fn finalize_counts(inner: &mut Inner) {
    let num_states = inner.fst.num_states();
    inner.total_count = vec![0.0; num_states];
    for s in 0..num_states as i32 {
        let mut total = 0.0;
        for arc in inner.fst.arcs(s) {
            if arc.ilabel != EPSILON_LABEL {
                total += arc.weight.max(0.0);
            }
        }
        total += inner.fst.final_weight(s).max(0.0);
        inner.total_count[s as usize] = total.max(0.0);
    }
    for s in 0..num_states as i32 {
        for arc in inner.fst.arcs_mut(s) {
            if arc.ilabel != EPSILON_LABEL {
                arc.weight = if arc.weight > 0.0 {
                    -arc.weight.ln()
                } else {
                    ZERO
                };
            }
        }
        let fw = inner.fst.final_weight(s);
        let new_fw = if fw > 0.0 { -fw.ln() } else { ZERO };
        inner.fst.set_final(s, new_fw);
    }
}

fn compute_state_orders(inner: &mut Inner) {
    let num_states = inner.fst.num_states();
    inner.state_orders = vec![-1; num_states];
    inner.state_orders[inner.unigram_state as usize] = 0;
    for s in 0..num_states as i32 {
        let mut order = None;
        let mut cur = s;
        let mut depth = 0;
        loop {
            if let Some(o) = inner.state_orders.get(cur as usize).copied().filter(|&o| o >= 0) {
                order = Some(o + depth);
                break;
            }
            match inner.fst.backoff(cur) {
                Some((b, _)) => {
                    cur = b;
                    depth += 1;
                }
                None => break,
            }
        }
        if let Some(o) = order {
            inner.state_orders[s as usize] = o;
        }
    }
}

impl LanguageModel for PpmAsFstModel {
    fn start_state(&self) -> i32 {
        self.inner.lock().unwrap().start_state
    }

    fn num_states(&self) -> i32 {
        self.inner.lock().unwrap().fst.num_states() as i32
    }

    fn state_sym(&self, _state: i32) -> i32 {
        -1
    }

    fn next_state(&self, state: i32, codepoint: u32) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        let state = if state < 0 { inner.start_state } else { state };
        match Self::sym_index(&inner, codepoint) {
            Some(label) => {
                let mut s = state;
                loop {
                    if let Some(next) = inner
                        .fst
                        .arcs(s)
                        .iter()
                        .find(|a| a.ilabel == label)
                        .map(|a| a.next_state)
                    {
                        return next;
                    }
                    match inner.fst.backoff(s) {
                        Some((b, _)) => s = b,
                        None => return inner.unigram_state,
                    }
                }
            }
            None => inner.start_state,
        }
    }

    fn extract_scores(&self, state: i32, out: &mut LmScores) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let state = if state < 0 { inner.start_state } else { state };
        Self::ensure_cache(&mut inner, self.alpha, self.beta, state);
        out.clear();
        let entry = inner.cache.get(&state).expect("just ensured");
        let n = inner.syms.num_symbols();
        for i in 0..n {
            let sym = if i == 0 {
                String::new()
            } else {
                inner.syms.find_label(i as i32).unwrap_or("").to_string()
            };
            out.symbols.push(sym);
            out.probabilities.push((-entry.neg_log_probs[i]).exp());
        }
        out.normalization = 1.0;
        true
    }

    fn sym_score(&self, state: i32, codepoint: u32) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        let state = if state < 0 { inner.start_state } else { state };
        Self::ensure_cache(&mut inner, self.alpha, self.beta, state);
        let label = if codepoint == 0 {
            0
        } else {
            Self::sym_index(&inner, codepoint).unwrap_or(-1)
        };
        if label < 0 {
            return ZERO;
        }
        inner
            .cache
            .get(&state)
            .map(|e| e.neg_log_probs[label as usize])
            .unwrap_or(ZERO)
    }

    fn update_counts(&self, state: i32, codepoints: &[u32], count: i64) -> bool {
        if self.static_model || count <= 0 {
            return true;
        }
        let mut inner = self.inner.lock().unwrap();
        let mut s = if state < 0 { inner.start_state } else { state };
        for &cp in codepoints {
            let label = match Self::sym_index(&inner, cp) {
                Some(l) => l,
                None => {
                    s = inner.start_state;
                    continue;
                }
            };
            Self::ensure_cache(&mut inner, self.alpha, self.beta, s);
            let (highest_found, dest_hint) = inner
                .cache
                .get(&s)
                .map(|e| (e.origin[label as usize], e.destination[label as usize]))
                .unwrap_or((-1, -1));
            let highest_found = if highest_found >= 0 { highest_found } else { s };

            let mut dest = Self::update_model(&mut inner, self.alpha, self.beta, self.max_order, s, highest_found, dest_hint, label);
            for _ in 1..count {
                dest = Self::update_model(&mut inner, self.alpha, self.beta, self.max_order, s, s, dest_hint, label);
            }
            s = dest;
        }
        true
    }

    fn is_static(&self) -> bool {
        self.static_model
    }
}

impl PpmAsFstModel {
    /// Bits- (or nats-) per-symbol evaluator (§4.2.3): walks the given
    /// symbol indices from the start state, reading the cached
    /// probability at each step and (for a dynamic model) updating
    /// counts before advancing.
    pub fn get_neg_log_probs(&self, codepoints: &[u32]) -> Vec<f64> {
        let mut inner = self.inner.lock().unwrap();
        let mut state = inner.start_state;
        let mut out = Vec::with_capacity(codepoints.len());
        for &cp in codepoints {
            Self::ensure_cache(&mut inner, self.alpha, self.beta, state);
            let label = match Self::sym_index(&inner, cp) {
                Some(l) => l,
                None => {
                    out.push(ZERO);
                    state = inner.start_state;
                    continue;
                }
            };
            let nlp = inner
                .cache
                .get(&state)
                .map(|e| e.neg_log_probs[label as usize])
                .unwrap_or(ZERO);
            out.push(nlp);
            if !self.static_model {
                let (highest_found, dest_hint) = inner
                    .cache
                    .get(&state)
                    .map(|e| (e.origin[label as usize], e.destination[label as usize]))
                    .unwrap_or((-1, -1));
                let highest_found = if highest_found >= 0 { highest_found } else { state };
                state = Self::update_model(&mut inner, self.alpha, self.beta, self.max_order, state, highest_found, dest_hint, label);
            } else {
                let mut s = state;
                loop {
                    if let Some(next) = inner
                        .fst
                        .arcs(s)
                        .iter()
                        .find(|a| a.ilabel == label)
                        .map(|a| a.next_state)
                    {
                        state = next;
                        break;
                    }
                    match inner.fst.backoff(s) {
                        Some((b, _)) => s = b,
                        None => {
                            state = inner.unigram_state;
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Serializes the current FST and symbol table with `bincode`, in
    /// the same `(VectorFst, SymbolTable)` shape `read` expects back
    /// when `ppm_options.model_is_fst = true`.
    pub fn serialize_fst(&self) -> Result<Vec<u8>, LmError> {
        let inner = self.inner.lock().unwrap();
        bincode::serialize(&(&inner.fst, &inner.syms))
            .map_err(|e| LmError::internal(format!("serializing ppm fst: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PpmAsFstOptions;

    fn default_options() -> PpmAsFstOptions {
        PpmAsFstOptions {
            max_order: 3,
            alpha: 0.5,
            beta: 0.75,
            static_model: false,
            max_cache_size: 100,
            model_is_fst: false,
        }
    }

    fn build_from_lines(lines: &[&str]) -> (Inner, PpmAsFstOptions) {
        let opts = default_options();
        let mut syms = SymbolTable::new();
        let (mut fst, unigram, start) = build_from_corpus(lines, opts.max_order, &mut syms);
        apply_update_exclusion(&mut fst, unigram, start);
        let mut inner = Inner {
            fst,
            syms,
            unigram_state: unigram,
            start_state: start,
            total_count: Vec::new(),
            state_orders: Vec::new(),
            cache: HashMap::new(),
            access_counter: 0,
            max_cache_size: opts.max_cache_size.max(1) as usize,
        };
        add_prior_counts(&mut inner, unigram);
        finalize_counts(&mut inner);
        compute_state_orders(&mut inner);
        (inner, opts)
    }

    #[test]
    fn extract_scores_at_unigram_sums_to_one() {
        let (mut inner, opts) = build_from_lines(&["aba", "aab"]);
        let unigram = inner.unigram_state;
        PpmAsFstModel::ensure_cache(&mut inner, opts.alpha, opts.beta, unigram);
        let probs = &inner.cache.get(&unigram).unwrap().neg_log_probs;
        let sum: f64 = probs.iter().map(|c| (-c).exp()).sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn extract_scores_at_start_state_sums_to_one() {
        let (mut inner, opts) = build_from_lines(&["aba", "aab", "baa"]);
        let start = inner.start_state;
        PpmAsFstModel::ensure_cache(&mut inner, opts.alpha, opts.beta, start);
        let probs = &inner.cache.get(&start).unwrap().neg_log_probs;
        let sum: f64 = probs.iter().map(|c| (-c).exp()).sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn update_exclusion_counts_distinct_continuations_not_raw_frequency() {
        // "a" is followed by "b" in three different bigram contexts
        // ("aa"->b does not occur, but "ba"->? etc.); what matters here
        // is that the unigram arc for a frequent symbol reflects prior
        // counts plus type counts, not the raw corpus frequency, so it
        // should stay modest even though "a" is the most frequent letter.
        let (inner, _opts) = build_from_lines(&["aaaa"]);
        let label_a = inner.syms.find("a").unwrap();
        let unigram_total = inner.total_count[inner.unigram_state as usize];
        // Raw frequency of "a" as a continuation is 4 (3 bigrams + final);
        // update-exclusion plus a single +1 prior should produce a much
        // smaller total than naive frequency counting would.
        assert!(unigram_total < 8.0);
        let _ = label_a;
    }

    #[test]
    fn dynamic_update_increases_probability_of_repeated_symbol() {
        let (inner, opts) = build_from_lines(&["ab"]);
        let model = PpmAsFstModel {
            inner: Mutex::new(inner),
            alpha: opts.alpha,
            beta: opts.beta,
            max_order: opts.max_order,
            static_model: false,
        };
        let start = model.start_state();
        let mut before = LmScores::default();
        model.extract_scores(start, &mut before);
        let idx_a = before.symbols.iter().position(|s| s == "a").unwrap();
        let p_before = before.probabilities[idx_a];

        assert!(model.update_counts(start, &['a' as u32], 5));

        let mut after = LmScores::default();
        model.extract_scores(start, &mut after);
        let p_after = after.probabilities[idx_a];
        assert!(p_after > p_before);
    }

    #[test]
    fn static_model_update_counts_is_a_no_op() {
        let (inner, opts) = build_from_lines(&["ab"]);
        let model = PpmAsFstModel {
            inner: Mutex::new(inner),
            alpha: opts.alpha,
            beta: opts.beta,
            max_order: opts.max_order,
            static_model: true,
        };
        assert!(model.update_counts(model.start_state(), &['a' as u32], 10));
        assert!(model.is_static());
    }
}
