#![forbid(unsafe_code)]

//! # cot-harness
//!
//! Measure how prompting strategies change multiple-choice reasoning accuracy.
//!
//! A sweep draws questions per language, renders each under four strategies
//! (zero-shot, few-shot, and their chain-of-thought variants), asks every
//! configured model for a strict JSON verdict, and appends one record per
//! (model, language, strategy, file, row) to a JSONL log. Malformed output is
//! repaired where possible; the reconcile pass deduplicates the log, applies
//! offline repairs, and aggregates accuracy and self-judgment agreement.

pub mod config;
pub mod dataset;
pub mod gateway;
pub mod interpret;
pub mod prompts;
pub mod reconcile;
pub mod record;
pub mod runner;
pub mod store;

pub use config::{ConfigError, LanguageSource, RunConfig};
pub use dataset::{collect_samples, EvaluationSample, SourceReadError};
pub use gateway::{
    Attribution, ChatGateway, GenerationParams, InvocationError, ProviderError, ProviderGateway,
    RetryPolicy, UsageSink,
};
pub use interpret::{parse_response, repair_output, Judgment, ParseOutcome, RepairMethod};
pub use prompts::{LeakageError, PromptBuilder, PromptInstance, Strategy};
pub use reconcile::{reconcile, repair_records, ReconcileError, ReconcileReport, RepairAttempt};
pub use record::{EvaluationRecord, RecordKey};
pub use runner::{run_sweep, SweepError, SweepSummary};
pub use store::{dedup_latest, RecordLog, StoreError};
