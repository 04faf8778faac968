//! Sweep runner: language × model × strategy × sample.
//!
//! Every prompt of the run is rendered (and leak-checked) before the first
//! provider call, so a leaking dataset aborts with nothing sent.

use std::collections::HashSet;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, RunConfig};
use crate::dataset::{collect_samples, EvaluationSample};
use crate::gateway::{Attribution, ChatGateway};
use crate::interpret::parse_response;
use crate::prompts::{LeakageError, PromptBuilder, PromptInstance};
use crate::record::{api_error_output, EvaluationRecord, RecordKey};
use crate::store::{resume_set, RecordLog, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Leakage(#[from] LeakageError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub appended: usize,
    pub skipped: usize,
    pub api_errors: usize,
    pub parse_errors: usize,
}

struct LanguagePlan<'a> {
    code: &'a str,
    samples: Vec<EvaluationSample>,
    /// `prompts[s][i]` renders strategy `s` for sample `i`.
    prompts: Vec<Vec<PromptInstance>>,
}

fn plan<'a>(
    config: &'a RunConfig,
    builder: &PromptBuilder,
) -> Result<Vec<LanguagePlan<'a>>, LeakageError> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut plans = Vec::with_capacity(config.languages.len());
    for lang in &config.languages {
        let samples = collect_samples(&lang.data_dir, config.samples_per_language, &mut rng);
        if samples.is_empty() {
            warn!(
                language = %lang.code,
                dir = %lang.data_dir.display(),
                "no samples for language"
            );
        }
        let prompts = config
            .strategies
            .iter()
            .map(|strategy| {
                samples
                    .iter()
                    .map(|sample| builder.build(*strategy, sample, &lang.code))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        plans.push(LanguagePlan {
            code: &lang.code,
            samples,
            prompts,
        });
    }
    Ok(plans)
}

pub async fn run_sweep(
    config: &RunConfig,
    gateway: &dyn ChatGateway,
    log: &mut RecordLog,
    builder: &PromptBuilder,
) -> Result<SweepSummary, SweepError> {
    config.validate()?;

    let done: HashSet<RecordKey> = if config.resume {
        let keys = resume_set(log.path())?;
        info!(existing = keys.len(), "resuming from existing log");
        keys
    } else {
        HashSet::new()
    };

    let plans = plan(config, builder)?;
    let run_id = Uuid::new_v4();
    let delay = Duration::from_millis(config.inter_call_delay_ms);
    let mut summary = SweepSummary::default();

    info!(%run_id, log = %log.path().display(), "starting sweep");

    for lang in &plans {
        for model in &config.models {
            for (strategy, prompts) in config.strategies.iter().zip(&lang.prompts) {
                let mut appended = 0usize;
                let mut skipped = 0usize;

                for (sample, prompt) in lang.samples.iter().zip(prompts) {
                    let key = RecordKey::new(
                        model,
                        lang.code,
                        strategy.as_str(),
                        &sample.source_file,
                        sample.row_index,
                    );
                    if done.contains(&key) {
                        skipped += 1;
                        continue;
                    }

                    let attribution = Attribution::new("runner::sweep").with_run(run_id);
                    let raw = match gateway
                        .generate(model, &prompt.text, &config.generation, attribution)
                        .await
                    {
                        Ok(content) => content,
                        Err(err) => {
                            summary.api_errors += 1;
                            api_error_output(err.last_error())
                        }
                    };

                    let outcome = parse_response(&raw);
                    let record = EvaluationRecord::from_outcome(
                        sample,
                        model,
                        lang.code,
                        strategy.as_str(),
                        raw,
                        outcome,
                    );
                    if record.parse_error {
                        summary.parse_errors += 1;
                    }
                    log.append(&record)?;
                    appended += 1;

                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }

                summary.appended += appended;
                summary.skipped += skipped;
                info!(
                    model = %model,
                    language = lang.code,
                    strategy = strategy.as_str(),
                    appended,
                    skipped,
                    "finished group"
                );
            }
        }
    }

    info!(
        appended = summary.appended,
        skipped = summary.skipped,
        api_errors = summary.api_errors,
        parse_errors = summary.parse_errors,
        "sweep finished"
    );
    Ok(summary)
}
