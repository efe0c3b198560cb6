//! Hand-rolled weighted finite-state transducer in the negative-log
//! semiring, plus the symbol table and arithmetic helpers the model
//! implementations build on.
//!
//! No crate in this workspace's dependency stack models a mutable
//! OpenFST-style automaton with backoff arcs (`fst` is a byte-keyed
//! immutable map, built for a different job), so this module plays the
//! role of that external collaborator directly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

use crate::config::ModelStorage;
use crate::error::LmError;

/// Epsilon / backoff label. By convention the first arc leaving a state,
/// when present, carries this label and is the backoff arc.
pub const EPSILON_LABEL: i32 = 0;

/// `Zero` of the negative-log semiring: probability 0.
pub const ZERO: f64 = f64::INFINITY;

/// `One` of the negative-log semiring: probability 1.
pub const ONE: f64 = 0.0;

/// `Times` in the negative-log semiring is ordinary addition.
#[inline]
pub fn times(a: f64, b: f64) -> f64 {
    a + b
}

/// `-log(exp(-a) + exp(-b))`, computed stably.
pub fn neg_log_sum(a: f64, b: f64) -> f64 {
    if a.is_infinite() && a > 0.0 {
        return b;
    }
    if b.is_infinite() && b > 0.0 {
        return a;
    }
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    lo - (-(hi - lo)).exp().ln_1p()
}

/// Kahan-compensated variant of [`neg_log_sum`] for iterative accumulation
/// over many terms (used by the softmax renormalizer).
pub fn neg_log_sum_compensated(a: f64, b: f64, compensation: &mut f64) -> f64 {
    if a.is_infinite() && a > 0.0 {
        return b;
    }
    if b.is_infinite() && b > 0.0 {
        return a;
    }
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let y = (-(hi - lo)).exp().ln_1p() - *compensation;
    let t = lo - y;
    *compensation = (t - lo) + y;
    t
}

/// `-log(exp(-a) - exp(-b))`, requires `a < b` (i.e. prob(a) > prob(b)).
/// Returns `Internal` when that precondition fails.
pub fn neg_log_diff(a: f64, b: f64) -> Result<f64, LmError> {
    if a >= b {
        return Err(LmError::internal(format!(
            "NegLogDiff produced left <= right: {a} >= {b}"
        )));
    }
    if b.is_infinite() {
        return Ok(a);
    }
    Ok(a - (1.0 - (-(b - a)).exp()).ln())
}

/// Clamped variant used by the word-FST cache builder: returns `ZERO`
/// (rather than erroring) when the subtraction would underflow, which
/// happens legitimately when floating point error makes two supposedly
/// equal cumulative sums compare as `a >= b`.
pub fn safe_neg_log_diff(a: f64, b: f64) -> f64 {
    match neg_log_diff(a, b) {
        Ok(v) => v,
        Err(_) => ZERO,
    }
}

/// Renormalizes a vector of negative-log values in place so that the
/// corresponding probabilities sum to 1.
pub fn softmax_renormalize(neg_log_probs: &mut [f64]) {
    if neg_log_probs.is_empty() {
        return;
    }
    let mut total = neg_log_probs[0];
    let mut kahan = 0.0;
    for &v in &neg_log_probs[1..] {
        total = neg_log_sum_compensated(total, v, &mut kahan);
    }
    for v in neg_log_probs.iter_mut() {
        *v -= total;
    }
}

/// Bidirectional string/label mapping. Label 0 is always `<epsilon>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolTable {
    symbols: Vec<String>,
    index: HashMap<String, i32>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut t = SymbolTable {
            symbols: Vec::new(),
            index: HashMap::new(),
        };
        t.add_symbol("<epsilon>");
        t
    }

    /// Adds `symbol`, returning its label. Returns the existing label if
    /// already present.
    pub fn add_symbol(&mut self, symbol: &str) -> i32 {
        if let Some(&label) = self.index.get(symbol) {
            return label;
        }
        let label = self.symbols.len() as i32;
        self.symbols.push(symbol.to_string());
        self.index.insert(symbol.to_string(), label);
        label
    }

    pub fn find(&self, symbol: &str) -> Option<i32> {
        self.index.get(symbol).copied()
    }

    pub fn find_label(&self, label: i32) -> Option<&str> {
        self.symbols.get(label as usize).map(|s| s.as_str())
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &str)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (i as i32, s.as_str()))
    }
}

/// One labeled, weighted arc.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Arc {
    pub ilabel: i32,
    pub weight: f64,
    pub next_state: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FstState {
    arcs: Vec<Arc>,
    final_weight: f64,
}

impl Default for FstState {
    fn default() -> Self {
        FstState {
            arcs: Vec::new(),
            final_weight: ZERO,
        }
    }
}

/// A mutable vector FST in the negative-log semiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorFst {
    states: Vec<FstState>,
    start: i32,
}

impl Default for VectorFst {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorFst {
    pub fn new() -> Self {
        VectorFst {
            states: Vec::new(),
            start: -1,
        }
    }

    pub fn add_state(&mut self) -> i32 {
        self.states.push(FstState::default());
        (self.states.len() - 1) as i32
    }

    pub fn set_start(&mut self, s: i32) {
        self.start = s;
    }

    pub fn start(&self) -> i32 {
        self.start
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn set_final(&mut self, s: i32, weight: f64) {
        self.states[s as usize].final_weight = weight;
    }

    pub fn final_weight(&self, s: i32) -> f64 {
        self.states[s as usize].final_weight
    }

    pub fn is_final(&self, s: i32) -> bool {
        self.final_weight(s) != ZERO
    }

    pub fn add_arc(&mut self, s: i32, arc: Arc) -> usize {
        let arcs = &mut self.states[s as usize].arcs;
        arcs.push(arc);
        arcs.len() - 1
    }

    pub fn arcs(&self, s: i32) -> &[Arc] {
        &self.states[s as usize].arcs
    }

    pub fn arcs_mut(&mut self, s: i32) -> &mut Vec<Arc> {
        &mut self.states[s as usize].arcs
    }

    pub fn num_arcs(&self, s: i32) -> usize {
        self.states[s as usize].arcs.len()
    }

    /// Sorts the arcs of `s` by input label, keeping the backoff arc (if
    /// any) first regardless of its label value.
    pub fn sort_arcs(&mut self, s: i32) {
        let arcs = &mut self.states[s as usize].arcs;
        arcs.sort_by_key(|a| a.ilabel);
    }

    pub fn sort_all_arcs(&mut self) {
        for s in 0..self.states.len() as i32 {
            self.sort_arcs(s);
        }
    }

    /// The first arc leaving `s`, if it is a backoff (epsilon-labeled)
    /// arc, along with the state it backs off to.
    pub fn backoff(&self, s: i32) -> Option<(i32, f64)> {
        self.states[s as usize]
            .arcs
            .first()
            .filter(|a| a.ilabel == EPSILON_LABEL)
            .map(|a| (a.next_state, a.weight))
    }
}

/// Adds a backoff n-gram "view" over a [`VectorFst`]: the unigram state,
/// highest order, and lightweight topology/normalization checks. Mirrors
/// the external `ngram::NGramModel<StdArc>` collaborator from the
/// original spec's §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NGramFst {
    pub fst: VectorFst,
    pub syms: SymbolTable,
    unigram_state: i32,
    hi_order: i32,
}

impl NGramFst {
    pub fn new(fst: VectorFst, syms: SymbolTable) -> Self {
        let unigram_state = Self::compute_unigram_state(&fst);
        NGramFst {
            fst,
            syms,
            unigram_state,
            hi_order: -1,
        }
    }

    fn compute_unigram_state(fst: &VectorFst) -> i32 {
        let mut s = fst.start();
        if s < 0 {
            return s;
        }
        loop {
            match fst.backoff(s) {
                Some((next, _)) => s = next,
                None => return s,
            }
        }
    }

    pub fn get_backoff(&self, s: i32) -> Option<(i32, f64)> {
        self.fst.backoff(s)
    }

    pub fn unigram_state(&self) -> i32 {
        self.unigram_state
    }

    pub fn hi_order(&self) -> i32 {
        self.hi_order
    }

    pub fn set_hi_order(&mut self, order: i32) {
        self.hi_order = order;
    }

    pub fn check_topology(&self) -> Result<(), LmError> {
        for s in 0..self.fst.num_states() as i32 {
            let arcs = self.fst.arcs(s);
            for (i, a) in arcs.iter().enumerate() {
                if a.ilabel == EPSILON_LABEL && i != 0 {
                    return Err(LmError::internal(format!(
                        "state {s} has a non-leading backoff arc"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn check_normalization(&self) -> Result<(), LmError> {
        for s in 0..self.fst.num_states() as i32 {
            for a in self.fst.arcs(s) {
                if a.weight.is_nan() {
                    return Err(LmError::internal(format!(
                        "state {s} has a NaN arc weight"
                    )));
                }
            }
            if self.fst.final_weight(s).is_nan() {
                return Err(LmError::internal(format!(
                    "state {s} has a NaN final weight"
                )));
            }
        }
        Ok(())
    }
}

/// Loads an [`NGramFst`] for a read-only model (char-FST / word-FST)
/// from a model storage descriptor. The model file holds the FST and its
/// symbol table together (bincode); the original's "sibling vocabulary
/// file" path applies only when the model file is entirely absent.
pub fn load_ngram_fst(storage: &ModelStorage) -> Result<NGramFst, LmError> {
    if !storage.model_file.is_empty() {
        let bytes = fs::read(&storage.model_file)
            .map_err(|e| LmError::not_found(format!("model file {}: {e}", storage.model_file)))?;
        let ngram_fst: NGramFst = bincode::deserialize(&bytes)
            .map_err(|e| LmError::not_found(format!("bad FST payload: {e}")))?;
        return Ok(ngram_fst);
    }
    if !storage.vocabulary_file.is_empty() {
        let content = fs::read_to_string(&storage.vocabulary_file).map_err(|e| {
            LmError::not_found(format!("vocabulary file {}: {e}", storage.vocabulary_file))
        })?;
        let mut syms = SymbolTable::new();
        for line in content.lines() {
            let line = line.trim();
            if !line.is_empty() {
                syms.add_symbol(line);
            }
        }
        let mut fst = VectorFst::new();
        let s0 = fst.add_state();
        fst.set_start(s0);
        fst.set_final(s0, ONE);
        return Ok(NGramFst::new(fst, syms));
    }
    Err(LmError::not_found(
        "neither model_file nor vocabulary_file supplied",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neg_log_sum_matches_direct_exp_computation() {
        let a = 0.5_f64;
        let b = 1.25_f64;
        let got = neg_log_sum(a, b);
        let want = -((-a).exp() + (-b).exp()).ln();
        assert!((got - want).abs() < 1e-12);
    }

    #[test]
    fn neg_log_sum_identity_with_zero() {
        assert_eq!(neg_log_sum(ZERO, 3.0), 3.0);
        assert_eq!(neg_log_sum(3.0, ZERO), 3.0);
    }

    #[test]
    fn neg_log_diff_round_trips_against_sum() {
        let a = 0.2_f64;
        let b = 2.0_f64;
        let summed = neg_log_sum(a, b);
        let recovered = neg_log_diff(a, summed).unwrap();
        assert!((recovered - b).abs() < 1e-9);
    }

    #[test]
    fn neg_log_diff_rejects_non_positive_difference() {
        assert!(neg_log_diff(2.0, 2.0).is_err());
        assert!(neg_log_diff(3.0, 2.0).is_err());
    }

    #[test]
    fn softmax_renormalize_sums_to_one() {
        let mut v = vec![0.1, 1.3, 2.7, 0.05];
        softmax_renormalize(&mut v);
        let sum: f64 = v.iter().map(|x| (-x).exp()).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn softmax_renormalize_is_idempotent() {
        let mut v = vec![0.1, 1.3, 2.7, 0.05];
        softmax_renormalize(&mut v);
        let once = v.clone();
        softmax_renormalize(&mut v);
        for (a, b) in once.iter().zip(v.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn backoff_is_first_epsilon_arc() {
        let mut fst = VectorFst::new();
        let s0 = fst.add_state();
        let s1 = fst.add_state();
        fst.set_start(s0);
        fst.add_arc(
            s1,
            Arc {
                ilabel: EPSILON_LABEL,
                weight: 0.5,
                next_state: s0,
            },
        );
        assert_eq!(fst.backoff(s1), Some((s0, 0.5)));
        assert_eq!(fst.backoff(s0), None);
    }

    #[test]
    fn symbol_table_reserves_epsilon_at_zero() {
        let mut t = SymbolTable::new();
        assert_eq!(t.find("<epsilon>"), Some(0));
        let a = t.add_symbol("a");
        let a_again = t.add_symbol("a");
        assert_eq!(a, a_again);
        assert_eq!(t.find_label(a), Some("a"));
    }
}
