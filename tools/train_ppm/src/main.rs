//! Builds a PPM-as-FST model from a text corpus and serializes it to a
//! bincode file, parallel to the teacher's `serialize_ngram` tool.

use clap::Parser;
use mozolm_core::{ModelStorage, ModelType, NgramWordFstOptions, PpmAsFstModel, PpmAsFstOptions};
use tracing::info;

#[derive(Parser)]
#[command(name = "train_ppm")]
#[command(about = "Trains a PPM-as-FST model from a text corpus")]
struct Args {
    /// One training line per sentence/utterance.
    corpus: String,

    /// Output path for the serialized FST model.
    #[arg(short, long, default_value = "ppm_model.bin")]
    output: String,

    /// Optional vocabulary file (one codepoint index per line) to seed
    /// unigram arcs beyond what the corpus itself contains.
    #[arg(long)]
    vocabulary: Option<String>,

    #[arg(long, default_value_t = 4)]
    max_order: i32,

    #[arg(long, default_value_t = 0.5)]
    alpha: f64,

    #[arg(long, default_value_t = 0.75)]
    beta: f64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let storage = ModelStorage {
        model_type: ModelType::PpmAsFst,
        model_file: args.corpus.clone(),
        vocabulary_file: args.vocabulary.clone().unwrap_or_default(),
        ppm_options: PpmAsFstOptions {
            max_order: args.max_order,
            alpha: args.alpha,
            beta: args.beta,
            static_model: false,
            max_cache_size: 2000,
            model_is_fst: false,
        },
        ngram_word_fst_options: NgramWordFstOptions::default(),
        weight: 0.0,
    };

    info!(corpus = %args.corpus, "building ppm-as-fst model");
    let model = PpmAsFstModel::read(&storage)?;
    let bytes = model.serialize_fst()?;
    std::fs::write(&args.output, &bytes)?;
    info!(output = %args.output, bytes = bytes.len(), "wrote serialized model");
    println!("Wrote {} ({} bytes)", args.output, bytes.len());
    Ok(())
}
