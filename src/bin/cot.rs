#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cot_harness::config::{LanguageSource, RunConfig};
use cot_harness::gateway::{LogUsageSink, ProviderGateway};
use cot_harness::prompts::{PromptBuilder, Strategy};
use cot_harness::reconcile::{self, load_repairs, repair_records, write_outputs, write_repairs};
use cot_harness::runner::run_sweep;
use cot_harness::store::{load_records, rewrite_deduplicated, RecordLog};

#[derive(Parser)]
#[command(name = "cot", version, about = "Prompting-strategy evaluation harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an evaluation sweep (LLM calls)
    Run {
        /// JSON run config; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        log: Option<PathBuf>,
        /// Questions drawn per language
        #[arg(long)]
        samples: Option<usize>,
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Skip keys already present in the log
        #[arg(long)]
        resume: bool,
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        strategies: Vec<Strategy>,
        #[arg(long)]
        seed: Option<u64>,
        /// Language source as code=dir; repeatable, replaces configured languages
        #[arg(long = "lang", value_parser = LanguageSource::parse_pair)]
        languages: Vec<LanguageSource>,
    },
    /// Keep the latest record per key (in place with a backup unless --out is given)
    Dedup {
        #[arg(long)]
        log: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Re-parse parse-error records offline
    Repair {
        #[arg(long)]
        log: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        summary: Option<PathBuf>,
    },
    /// Dedup, apply repairs, and write aggregate tables and a report
    Reconcile {
        #[arg(long)]
        log: PathBuf,
        #[arg(long)]
        repairs: Option<PathBuf>,
        #[arg(long)]
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            log,
            samples,
            delay_ms,
            resume,
            models,
            strategies,
            seed,
            languages,
        } => {
            let mut cfg = match config {
                Some(path) => RunConfig::load_from_path(&path)?,
                None => RunConfig::default(),
            };
            if let Some(log) = log {
                cfg.log_path = log;
            }
            if let Some(samples) = samples {
                cfg.samples_per_language = samples;
            }
            if let Some(delay_ms) = delay_ms {
                cfg.inter_call_delay_ms = delay_ms;
            }
            if resume {
                cfg.resume = true;
            }
            if !models.is_empty() {
                cfg.models = models;
            }
            if !strategies.is_empty() {
                cfg.strategies = strategies;
            }
            if seed.is_some() {
                cfg.seed = seed;
            }
            if !languages.is_empty() {
                cfg.languages = languages;
            }
            cfg.validate()?;

            let gateway = ProviderGateway::from_env(Arc::new(LogUsageSink), cfg.retry.clone())?;
            let mut log = RecordLog::open(&cfg.log_path)?;
            let summary = run_sweep(&cfg, &gateway, &mut log, &PromptBuilder::new()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Dedup { log, out } => {
            let outcome = rewrite_deduplicated(&log, out.as_deref())?;
            println!("before: {}", outcome.before);
            println!("after: {}", outcome.after);
            if let Some(backup) = outcome.backup {
                println!("backup: {}", backup.display());
            }
        }
        Commands::Repair { log, out, summary } => {
            let records = load_records(&log)?;
            let (repairs, totals) = repair_records(&records);
            write_repairs(&out, &repairs)?;
            if let Some(path) = summary {
                write_json(&path, &totals)?;
            }
            println!(
                "parse errors: {}, repaired: {}, failed: {}",
                totals.total_parse_errors, totals.repaired, totals.failed
            );
        }
        Commands::Reconcile {
            log,
            repairs,
            out_dir,
        } => {
            let records = load_records(&log)?;
            let repairs = match repairs {
                Some(path) => load_repairs(&path)?,
                None => Vec::new(),
            };
            let (deduped, report) = reconcile::reconcile(records, &repairs);
            let outputs = write_outputs(&out_dir, &deduped, &report)?;
            println!(
                "records: {} -> {} (repairs applied: {})",
                report.raw_records, report.unique_records, report.repairs_applied
            );
            println!("report: {}", outputs.report.display());
        }
    }

    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
