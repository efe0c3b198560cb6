//! Dense bigram character model (spec §4.5). The simplest of the four
//! model variants and the only one with a meaningful built-in default
//! (a uniform 28-symbol alphabet), used as the smoke-test fixture.

use std::collections::HashMap;
use std::fs;
use std::sync::RwLock;

use tracing::debug;

use crate::config::ModelStorage;
use crate::error::LmError;
use crate::language_model::{LanguageModel, LmScores};
use crate::utf8::encode_codepoint;

/// `</S>`, space, then lowercase a-z: the default alphabet used when no
/// model files are supplied.
fn default_alphabet() -> Vec<u32> {
    let mut v = vec![0u32, 32u32];
    v.extend((b'a'..=b'z').map(u32::from));
    v
}

pub struct SimpleBigramCharModel {
    vocab: Vec<u32>,
    vocab_index: HashMap<u32, i32>,
    bigram_counts: RwLock<Vec<Vec<u64>>>,
    normalizer: RwLock<Vec<u64>>,
}

impl SimpleBigramCharModel {
    /// Uniform-over-28-symbols default, matching scenario 1 of the
    /// testable-properties section: `extract_scores(0)` returns 28
    /// symbols each with probability `1/28`.
    pub fn new_default() -> Self {
        let vocab = default_alphabet();
        let v = vocab.len();
        Self::from_vocab_and_counts(vocab, vec![vec![1u64; v]; v])
    }

    pub fn read(storage: &ModelStorage) -> Result<Self, LmError> {
        if storage.vocabulary_file.is_empty() || storage.model_file.is_empty() {
            debug!("simple bigram model: no files supplied, using default alphabet");
            return Ok(Self::new_default());
        }
        let vocab = read_vocab_symbols(&storage.vocabulary_file)?;
        let counts = read_count_matrix(&storage.model_file, vocab.len())?;
        if counts.is_empty() {
            debug!("simple bigram model: empty count matrix, falling back to uniform");
            let v = vocab.len().max(1);
            return Ok(Self::from_vocab_and_counts(vocab, vec![vec![1u64; v]; v]));
        }
        Ok(Self::from_vocab_and_counts(vocab, counts))
    }

    fn from_vocab_and_counts(vocab: Vec<u32>, counts: Vec<Vec<u64>>) -> Self {
        let vocab_index = vocab
            .iter()
            .enumerate()
            .map(|(i, &cp)| (cp, i as i32))
            .collect();
        let normalizer = counts.iter().map(|row| row.iter().sum()).collect();
        SimpleBigramCharModel {
            vocab,
            vocab_index,
            bigram_counts: RwLock::new(counts),
            normalizer: RwLock::new(normalizer),
        }
    }

    fn valid_state(&self, s: i32) -> bool {
        s >= 0 && (s as usize) < self.vocab.len()
    }

    fn sym_state(&self, codepoint: u32) -> i32 {
        self.vocab_index.get(&codepoint).copied().unwrap_or(-1)
    }

    fn symbol_string(&self, state: i32) -> String {
        let cp = self.vocab[state as usize];
        if cp == 0 {
            String::new()
        } else {
            encode_codepoint(cp).unwrap_or_default()
        }
    }
}

/// Reads strictly-increasing numeric codepoint indices, one per line.
fn read_vocab_symbols(path: &str) -> Result<Vec<u32>, LmError> {
    let content = fs::read_to_string(path)
        .map_err(|e| LmError::not_found(format!("vocabulary file {path}: {e}")))?;
    let mut vocab = Vec::new();
    let mut prev: Option<u32> = None;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let cp: u32 = line
            .parse()
            .map_err(|_| LmError::internal(format!("malformed vocabulary line: {line}")))?;
        if let Some(p) = prev {
            if cp <= p {
                return Err(LmError::internal(
                    "vocabulary file codepoints must be strictly increasing",
                ));
            }
        }
        prev = Some(cp);
        vocab.push(cp);
    }
    Ok(vocab)
}

/// Reads `V` space-separated integers per row, one row per vocabulary
/// symbol. Counts less than one default to one.
fn read_count_matrix(path: &str, vocab_len: usize) -> Result<Vec<Vec<u64>>, LmError> {
    let content = fs::read_to_string(path)
        .map_err(|e| LmError::not_found(format!("bigram matrix file {path}: {e}")))?;
    let mut matrix = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row: Result<Vec<u64>, _> = line
            .split_whitespace()
            .map(|tok| tok.parse::<i64>())
            .collect();
        let row = row.map_err(|_| LmError::internal(format!("malformed matrix row: {line}")))?;
        let row: Vec<u64> = row.iter().map(|&c| c.max(1) as u64).collect();
        if row.len() != vocab_len {
            return Err(LmError::internal(format!(
                "matrix row has {} entries, expected {vocab_len}",
                row.len()
            )));
        }
        matrix.push(row);
    }
    Ok(matrix)
}

impl LanguageModel for SimpleBigramCharModel {
    fn start_state(&self) -> i32 {
        0
    }

    fn num_states(&self) -> i32 {
        self.vocab.len() as i32
    }

    fn state_sym(&self, state: i32) -> i32 {
        if self.valid_state(state) {
            self.vocab[state as usize] as i32
        } else {
            -1
        }
    }

    fn next_state(&self, _state: i32, codepoint: u32) -> i32 {
        self.sym_state(codepoint)
    }

    fn extract_scores(&self, state: i32, out: &mut LmScores) -> bool {
        let state = if self.valid_state(state) { state } else { 0 };
        out.clear();
        let normalizer = self.normalizer.read().unwrap();
        let counts = self.bigram_counts.read().unwrap();
        let total = normalizer[state as usize].max(1);
        for i in 0..self.vocab.len() {
            out.symbols.push(self.symbol_string(i as i32));
            out.probabilities
                .push(counts[state as usize][i] as f64 / total as f64);
        }
        out.normalization = 1.0;
        true
    }

    fn sym_score(&self, state: i32, codepoint: u32) -> f64 {
        let state = if self.valid_state(state) { state } else { 0 };
        let mut next = self.sym_state(codepoint);
        if !self.valid_state(next) {
            next = 0;
        }
        let normalizer = self.normalizer.read().unwrap();
        let counts = self.bigram_counts.read().unwrap();
        let p = counts[state as usize][next as usize] as f64 / normalizer[state as usize].max(1) as f64;
        -p.ln()
    }

    fn update_counts(&self, state: i32, codepoints: &[u32], count: i64) -> bool {
        if count <= 0 {
            return true;
        }
        let mut state = if self.valid_state(state) { state } else { 0 };
        let mut normalizer = self.normalizer.write().unwrap();
        let mut counts = self.bigram_counts.write().unwrap();
        for &cp in codepoints {
            let next = self.sym_state(cp);
            if !self.valid_state(next) {
                state = 0;
                continue;
            }
            counts[state as usize][next as usize] += count as u64;
            normalizer[state as usize] += count as u64;
            state = next;
        }
        true
    }

    fn is_static(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_is_uniform_over_28_symbols() {
        let model = SimpleBigramCharModel::new_default();
        let mut out = LmScores::default();
        assert!(model.extract_scores(0, &mut out));
        assert_eq!(out.symbols.len(), 28);
        for p in &out.probabilities {
            assert!((p - 1.0 / 28.0).abs() < 1e-6);
        }
    }

    #[test]
    fn update_counts_shifts_distribution_toward_observed_symbol() {
        let model = SimpleBigramCharModel::new_default();
        let a = b'a' as u32;
        assert!(model.update_counts(0, &[a, a, a, a, a, a, a, a, a, a], 1));
        let mut out = LmScores::default();
        model.extract_scores(0, &mut out);
        let idx = out.symbols.iter().position(|s| s == "a").unwrap();
        assert!(out.probabilities[idx] > 1.0 / 28.0);
    }

    #[test]
    fn unknown_codepoint_resets_to_start_state() {
        let model = SimpleBigramCharModel::new_default();
        let unknown = 0x4e2d; // not in the default alphabet
        assert!(model.update_counts(0, &[unknown], 1));
        // No panic, and state 0's normalizer is untouched by the unknown symbol.
        let mut out = LmScores::default();
        model.extract_scores(0, &mut out);
        let sum: f64 = out.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }
}
