//! mozolm-core
//!
//! Character-level language-model hub: a simple bigram model, character
//! and word n-gram FSTs, and a PPM-as-FST model, served behind a single
//! hub that can run one model or mix several of them.
//!
//! Public API:
//! - `LanguageModel` - trait implemented by every served model
//! - `LanguageModelHub` - composes one or more models behind one interface
//! - `LmScores` - a state's symbol/probability distribution
//! - `ModelHubConfig` - on-disk hub configuration
//! - `evaluate_corpus` - cross-entropy evaluation over a text corpus

pub mod wfst;
pub mod error;
pub use error::{LmError, LmResult};

pub mod utf8;

pub mod language_model;
pub use language_model::{top_hypotheses, LanguageModel, LmScores};

pub mod config;
pub use config::{
    MixtureType, ModelHubConfig, ModelStorage, ModelType, NgramWordFstOptions, PpmAsFstOptions,
};

pub mod simple_bigram;
pub use simple_bigram::SimpleBigramCharModel;

pub mod char_fst;
pub use char_fst::CharFstModel;

pub mod word_fst;
pub use word_fst::WordFstModel;

pub mod ppm_model;
pub use ppm_model::PpmAsFstModel;

pub mod hub;
pub use hub::LanguageModelHub;

pub mod cross_entropy;
pub use cross_entropy::{evaluate_corpus, CorpusEvaluation};

pub mod rand_gen;
