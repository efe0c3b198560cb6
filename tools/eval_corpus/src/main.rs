//! Runs the cross-entropy evaluator over a corpus file and prints the
//! bits-per-character summary, parallel to the teacher's small
//! inspection binaries (`inspect_redb`, `list_fst_keys`).

use clap::Parser;
use mozolm_core::{evaluate_corpus, LanguageModelHub, ModelHubConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "eval_corpus")]
#[command(about = "Evaluates bits-per-character for a corpus against a model hub config")]
struct Args {
    /// Path to a ModelHubConfig TOML file.
    config: String,

    /// Corpus file, one sample per line.
    corpus: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    info!(config = %args.config, "loading model hub");
    let config = ModelHubConfig::load(&args.config)?;
    let hub = LanguageModelHub::new(&config)?;

    let eval = evaluate_corpus(&hub, &args.corpus)?;
    println!("{eval}");
    Ok(())
}
