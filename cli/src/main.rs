//! Line-oriented front end over the engine's three operations, standing
//! in for the out-of-scope RPC transport. One command per line:
//!
//!   GET_NEXT_STATE <state> <context>
//!   GET_LM_SCORES <state>
//!   UPDATE_LM_SCORES <state> <count> <context>
//!
//! `<context>` may contain spaces; it runs to the end of the line.

use std::io::{self, BufRead, Write};

use clap::Parser;
use mozolm_core::{
    LanguageModelHub, LmScores, MixtureType, ModelHubConfig, ModelStorage, ModelType,
    NgramWordFstOptions, PpmAsFstOptions,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mozolm-cli")]
#[command(about = "Interactive front end for the character-level language-model hub")]
struct Args {
    /// Path to a ModelHubConfig TOML file.
    #[arg(long)]
    config: Option<String>,
}

fn load_hub(args: &Args) -> anyhow::Result<LanguageModelHub> {
    let config = match &args.config {
        Some(path) => {
            info!(path, "loading model hub config");
            ModelHubConfig::load(path)?
        }
        None => {
            warn!("no --config given, serving the default simple-bigram alphabet");
            ModelHubConfig {
                mixture_type: MixtureType::None,
                models: vec![ModelStorage {
                    model_type: ModelType::SimpleCharBigram,
                    model_file: String::new(),
                    vocabulary_file: String::new(),
                    ppm_options: PpmAsFstOptions::default(),
                    ngram_word_fst_options: NgramWordFstOptions::default(),
                    weight: 0.0,
                }],
                bayesian_history_length: 0,
                max_hub_states: 10_000,
            }
        }
    };
    Ok(LanguageModelHub::new(&config)?)
}

fn print_scores(out: &LmScores) {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    for (sym, p) in out.symbols.iter().zip(out.probabilities.iter()) {
        let shown = if sym.is_empty() { "</s>" } else { sym };
        let _ = writeln!(handle, "{shown}\t{p:.6}");
    }
    let _ = writeln!(handle);
}

fn run_line(hub: &LanguageModelHub, line: &str) {
    let mut parts = line.splitn(2, ' ');
    let cmd = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim();

    match cmd {
        "GET_NEXT_STATE" => {
            let mut fields = rest.splitn(2, ' ');
            let state: i32 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(-1);
            let context = fields.next().unwrap_or("");
            let next = hub.context_state(context, state);
            println!("{next}");
        }
        "GET_LM_SCORES" => {
            let state: i32 = rest.trim().parse().unwrap_or(-1);
            let mut out = LmScores::default();
            if hub.extract_scores(state, &mut out) {
                print_scores(&out);
            } else {
                warn!(state, "extract_scores failed");
                println!("ERROR");
            }
        }
        "UPDATE_LM_SCORES" => {
            let mut fields = rest.splitn(3, ' ');
            let state: i32 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(-1);
            let count: i64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(1);
            let context = fields.next().unwrap_or("");
            let codepoints: Vec<u32> = context.chars().map(u32::from).collect();
            if !hub.update_counts(state, &codepoints, count) {
                warn!(state, "update_counts failed");
                println!("ERROR");
                return;
            }
            let dest = hub.context_state(context, state);
            let mut out = LmScores::default();
            if hub.extract_scores(dest, &mut out) {
                println!("{dest}");
                print_scores(&out);
            } else {
                println!("ERROR");
            }
        }
        "" => {}
        other => {
            eprintln!("unrecognized command: {other}");
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let hub = load_hub(&args)?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        run_line(&hub, &line);
    }
    Ok(())
}
