//! Configuration structs, loaded from TOML the same way the teacher's
//! `Config::load` reads and parses its config file with `toml`+`serde`
//! and propagates errors with `anyhow`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_max_order() -> i32 {
    4
}

fn default_alpha() -> f64 {
    0.5
}

fn default_beta() -> f64 {
    0.75
}

fn default_max_cache_size() -> i32 {
    2000
}

fn default_max_hub_states() -> i32 {
    10_000
}

fn default_weight() -> f64 {
    0.0
}

/// `ppm_options` from the model storage descriptor (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PpmAsFstOptions {
    pub max_order: i32,
    pub alpha: f64,
    pub beta: f64,
    pub static_model: bool,
    pub max_cache_size: i32,
    pub model_is_fst: bool,
}

impl Default for PpmAsFstOptions {
    fn default() -> Self {
        PpmAsFstOptions {
            max_order: default_max_order(),
            alpha: default_alpha(),
            beta: default_beta(),
            static_model: false,
            max_cache_size: default_max_cache_size(),
            model_is_fst: false,
        }
    }
}

/// `ngram_word_fst_options` from the model storage descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NgramWordFstOptions {
    pub max_cache_size: i32,
}

impl Default for NgramWordFstOptions {
    fn default() -> Self {
        NgramWordFstOptions {
            max_cache_size: default_max_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelType {
    SimpleCharBigram,
    CharNgramFst,
    PpmAsFst,
    WordNgramFst,
}

/// One entry of the model storage descriptor (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStorage {
    #[serde(rename = "type")]
    pub model_type: ModelType,
    #[serde(default)]
    pub model_file: String,
    #[serde(default)]
    pub vocabulary_file: String,
    #[serde(default)]
    pub ppm_options: PpmAsFstOptions,
    #[serde(default)]
    pub ngram_word_fst_options: NgramWordFstOptions,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MixtureType {
    None,
    Interpolation,
}

impl Default for MixtureType {
    fn default() -> Self {
        MixtureType::None
    }
}

/// Top-level hub configuration (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHubConfig {
    #[serde(default)]
    pub mixture_type: MixtureType,
    pub models: Vec<ModelStorage>,
    #[serde(default)]
    pub bayesian_history_length: i32,
    #[serde(default = "default_max_hub_states")]
    pub max_hub_states: i32,
}

impl ModelHubConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading model hub config from {}", path.display()))?;
        let config: ModelHubConfig = toml::from_str(&content)
            .with_context(|| format!("parsing model hub config from {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml_str = r#"
            [[models]]
            type = "PPM_AS_FST"
            model_file = ""
        "#;
        let config: ModelHubConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.models.len(), 1);
        assert_eq!(config.models[0].model_type, ModelType::PpmAsFst);
        assert_eq!(config.models[0].ppm_options.max_order, 4);
        assert_eq!(config.max_hub_states, 10_000);
    }

    #[test]
    fn parses_overridden_ppm_options() {
        let toml_str = r#"
            mixture_type = "INTERPOLATION"
            bayesian_history_length = 2

            [[models]]
            type = "PPM_AS_FST"
            weight = 0.0
            [models.ppm_options]
            max_order = 3
            alpha = 0.5
            beta = 0.75
            static_model = true
        "#;
        let config: ModelHubConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mixture_type, MixtureType::Interpolation);
        assert_eq!(config.models[0].ppm_options.max_order, 3);
        assert!(config.models[0].ppm_options.static_model);
    }
}
