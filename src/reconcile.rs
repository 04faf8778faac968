//! Offline repair, dedup, and aggregation over a record log.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::interpret::{
    normalize_choice, normalize_self_judgment, repair_output, truncate_reason, Judgment,
    RepairMethod,
};
use crate::record::{EvaluationRecord, RecordKey};
use crate::store::{dedup_latest, write_records, StoreError};

const RAW_SNIPPET_CHARS: usize = 1000;
const TOP_ERROR_MESSAGES: usize = 20;

pub const DEDUP_FILE: &str = "structured_results.dedup.jsonl";
pub const GROUP_STATS_FILE: &str = "group_stats.csv";
pub const OVERALL_STATS_FILE: &str = "overall_stats.csv";
pub const SUMMARY_FILE: &str = "summary.json";
pub const REPORT_FILE: &str = "report.md";

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("serialization error: {0}")]
    Serde(String),
}

// =============================================================================
// REPAIR
// =============================================================================

/// Outcome of re-parsing one `parse_error` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub model: String,
    pub language: String,
    pub strategy: String,
    pub file: String,
    pub row_index: u64,
    pub original_parse_error_msg: String,
    /// Rung that produced `parsed`; `None` when nothing did.
    pub repair_method: Option<RepairMethod>,
    pub repaired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Judgment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_snippet: Option<String>,
}

impl RepairAttempt {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(
            &self.model,
            &self.language,
            &self.strategy,
            &self.file,
            self.row_index,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairSummary {
    pub total_parse_errors: usize,
    pub repaired: usize,
    pub failed: usize,
    pub by_method: BTreeMap<String, usize>,
    /// Most frequent original error messages, descending.
    pub top_error_messages: Vec<(String, usize)>,
}

/// Run the repair ladder over every `parse_error` record.
pub fn repair_records(records: &[EvaluationRecord]) -> (Vec<RepairAttempt>, RepairSummary) {
    let mut attempts = Vec::new();
    let mut summary = RepairSummary::default();
    let mut messages: BTreeMap<String, usize> = BTreeMap::new();

    for rec in records.iter().filter(|r| r.parse_error) {
        summary.total_parse_errors += 1;
        let msg = if rec.parse_error_msg.is_empty() {
            "<none>".to_string()
        } else {
            rec.parse_error_msg.clone()
        };
        *messages.entry(msg.clone()).or_default() += 1;

        let mut attempt = RepairAttempt {
            model: rec.model.clone(),
            language: rec.language.clone(),
            strategy: rec.strategy.clone(),
            file: rec.file.clone(),
            row_index: rec.row_index,
            original_parse_error_msg: msg,
            repair_method: None,
            repaired: false,
            parsed: None,
            raw_snippet: None,
        };

        match repair_output(&rec.model_raw_output) {
            Ok((judgment, method)) => {
                summary.repaired += 1;
                *summary.by_method.entry(method.as_str().to_string()).or_default() += 1;
                attempt.repair_method = Some(method);
                attempt.repaired = true;
                attempt.parsed = Some(judgment);
            }
            Err(_) => {
                summary.failed += 1;
                attempt.raw_snippet =
                    Some(rec.model_raw_output.chars().take(RAW_SNIPPET_CHARS).collect());
            }
        }
        attempts.push(attempt);
    }

    let mut top: Vec<(String, usize)> = messages.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top.truncate(TOP_ERROR_MESSAGES);
    summary.top_error_messages = top;

    info!(
        total = summary.total_parse_errors,
        repaired = summary.repaired,
        failed = summary.failed,
        "repair pass finished"
    );
    (attempts, summary)
}

/// Overwrite parse-error records that have a successful repair; returns how many changed.
pub fn apply_repairs(records: &mut [EvaluationRecord], repairs: &[RepairAttempt]) -> usize {
    let by_key: BTreeMap<RecordKey, &Judgment> = repairs
        .iter()
        .filter(|r| r.repaired)
        .filter_map(|r| r.parsed.as_ref().map(|p| (r.key(), p)))
        .collect();

    let mut applied = 0;
    for rec in records.iter_mut().filter(|r| r.parse_error) {
        let Some(judgment) = by_key.get(&rec.key()) else {
            continue;
        };
        rec.predicted_choice = normalize_choice(&judgment.choice);
        rec.predicted_reason = truncate_reason(&judgment.reason);
        rec.predicted_self_judgment = normalize_self_judgment(&judgment.self_judgment);
        rec.parse_error = false;
        rec.parse_error_msg.clear();
        rec.recompute_derived();
        applied += 1;
    }
    applied
}

pub fn load_repairs(path: &Path) -> Result<Vec<RepairAttempt>, ReconcileError> {
    let reader = BufReader::new(File::open(path)?);
    let mut repairs = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RepairAttempt>(&line) {
            Ok(r) => repairs.push(r),
            Err(err) => warn!(line = idx + 1, error = %err, "skipping undecodable repair line"),
        }
    }
    Ok(repairs)
}

pub fn write_repairs(path: &Path, repairs: &[RepairAttempt]) -> Result<(), ReconcileError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for r in repairs {
        let line = serde_json::to_string(r).map_err(|e| ReconcileError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

// =============================================================================
// AGGREGATES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub model: String,
    pub strategy: String,
    pub language: String,
    pub category: String,
    pub n_samples: usize,
    pub accuracy: f64,
    pub self_judgment_agreement: f64,
    pub avg_reason_length: f64,
    pub median_reason_length: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallStats {
    pub model: String,
    pub language: String,
    pub n_samples: usize,
    pub accuracy: f64,
    pub self_judgment_agreement: f64,
}

/// Mutually exclusive record outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeBreakdown {
    pub ok: usize,
    pub parse_error: usize,
    pub api_error: usize,
}

impl OutcomeBreakdown {
    fn count(&mut self, rec: &EvaluationRecord) {
        if rec.is_api_error() {
            self.api_error += 1;
        } else if rec.parse_error {
            self.parse_error += 1;
        } else {
            self.ok += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub raw_records: usize,
    pub unique_records: usize,
    pub duplicates_removed: usize,
    pub repairs_applied: usize,
    pub outcomes: OutcomeBreakdown,
    pub records_per_model: BTreeMap<String, usize>,
    /// Counts per predicted choice; the empty choice is keyed as `""`.
    pub choice_distribution: BTreeMap<String, usize>,
    pub groups: Vec<GroupStats>,
    pub overall: Vec<OverallStats>,
}

fn ratio(hits: usize, n: usize) -> f64 {
    if n == 0 {
        0.0
    } else {
        hits as f64 / n as f64
    }
}

fn median(values: &mut [usize]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) as f64 / 2.0
    } else {
        values[mid] as f64
    }
}

pub fn group_stats(records: &[EvaluationRecord]) -> Vec<GroupStats> {
    let mut groups: BTreeMap<(&str, &str, &str, &str), Vec<&EvaluationRecord>> = BTreeMap::new();
    for rec in records {
        groups
            .entry((
                rec.model.as_str(),
                rec.strategy.as_str(),
                rec.language.as_str(),
                rec.category.as_str(),
            ))
            .or_default()
            .push(rec);
    }

    groups
        .into_iter()
        .map(|((model, strategy, language, category), recs)| {
            let n = recs.len();
            let correct = recs.iter().filter(|r| r.is_correct).count();
            let agree = recs.iter().filter(|r| r.self_judgment_agrees()).count();
            let mut lengths: Vec<usize> = recs.iter().map(|r| r.reason_length).collect();
            let total_len: usize = lengths.iter().sum();
            GroupStats {
                model: model.to_string(),
                strategy: strategy.to_string(),
                language: language.to_string(),
                category: category.to_string(),
                n_samples: n,
                accuracy: ratio(correct, n),
                self_judgment_agreement: ratio(agree, n),
                avg_reason_length: if n == 0 { 0.0 } else { total_len as f64 / n as f64 },
                median_reason_length: median(&mut lengths),
            }
        })
        .collect()
}

pub fn overall_stats(records: &[EvaluationRecord]) -> Vec<OverallStats> {
    let mut groups: BTreeMap<(&str, &str), (usize, usize, usize)> = BTreeMap::new();
    for rec in records {
        let entry = groups.entry((rec.model.as_str(), rec.language.as_str())).or_default();
        entry.0 += 1;
        entry.1 += usize::from(rec.is_correct);
        entry.2 += usize::from(rec.self_judgment_agrees());
    }
    groups
        .into_iter()
        .map(|((model, language), (n, correct, agree))| OverallStats {
            model: model.to_string(),
            language: language.to_string(),
            n_samples: n,
            accuracy: ratio(correct, n),
            self_judgment_agreement: ratio(agree, n),
        })
        .collect()
}

/// Dedup, apply repairs, and aggregate.
pub fn reconcile(
    raw: Vec<EvaluationRecord>,
    repairs: &[RepairAttempt],
) -> (Vec<EvaluationRecord>, ReconcileReport) {
    let raw_records = raw.len();
    let mut records = dedup_latest(raw);
    let repairs_applied = apply_repairs(&mut records, repairs);

    let mut outcomes = OutcomeBreakdown::default();
    let mut records_per_model: BTreeMap<String, usize> = BTreeMap::new();
    let mut choice_distribution: BTreeMap<String, usize> = BTreeMap::new();
    for rec in &records {
        outcomes.count(rec);
        *records_per_model.entry(rec.model.clone()).or_default() += 1;
        *choice_distribution.entry(rec.predicted_choice.clone()).or_default() += 1;
    }

    let report = ReconcileReport {
        raw_records,
        unique_records: records.len(),
        duplicates_removed: raw_records - records.len(),
        repairs_applied,
        outcomes,
        records_per_model,
        choice_distribution,
        groups: group_stats(&records),
        overall: overall_stats(&records),
    };
    (records, report)
}

// =============================================================================
// OUTPUT
// =============================================================================

pub fn render_report_markdown(report: &ReconcileReport) -> String {
    let mut out = String::new();
    out.push_str("# Evaluation Report\n\n");
    out.push_str(&format!("- Raw records: {}\n", report.raw_records));
    out.push_str(&format!(
        "- Unique records: {} ({} duplicates removed)\n",
        report.unique_records, report.duplicates_removed
    ));
    out.push_str(&format!("- Repairs applied: {}\n", report.repairs_applied));
    out.push_str(&format!(
        "- Outcomes ok/parse_error/api_error: {}/{}/{}\n",
        report.outcomes.ok, report.outcomes.parse_error, report.outcomes.api_error
    ));

    out.push_str("\n## Overall\n\n");
    out.push_str("| model | language | n | accuracy | self-judgment agreement |\n");
    out.push_str("|---|---|---:|---:|---:|\n");
    for o in &report.overall {
        out.push_str(&format!(
            "| {} | {} | {} | {:.3} | {:.3} |\n",
            o.model, o.language, o.n_samples, o.accuracy, o.self_judgment_agreement
        ));
    }

    // Model x strategy accuracy per language, pooled over categories.
    let mut pivot: BTreeMap<(&str, &str), BTreeMap<&str, (usize, f64)>> = BTreeMap::new();
    let mut strategies: Vec<&str> = Vec::new();
    for g in &report.groups {
        if !strategies.contains(&g.strategy.as_str()) {
            strategies.push(g.strategy.as_str());
        }
        let cell = pivot
            .entry((g.language.as_str(), g.model.as_str()))
            .or_default()
            .entry(g.strategy.as_str())
            .or_default();
        cell.0 += g.n_samples;
        cell.1 += g.accuracy * g.n_samples as f64;
    }
    strategies.sort_unstable();

    if !pivot.is_empty() {
        out.push_str("\n## Accuracy by strategy\n\n");
        out.push_str(&format!("| language | model | {} |\n", strategies.join(" | ")));
        out.push_str(&format!("|---|---|{}\n", "---:|".repeat(strategies.len())));
        for ((language, model), cells) in &pivot {
            let row: Vec<String> = strategies
                .iter()
                .map(|s| match cells.get(s) {
                    Some((n, hits)) if *n > 0 => format!("{:.3}", hits / *n as f64),
                    _ => "-".to_string(),
                })
                .collect();
            out.push_str(&format!("| {} | {} | {} |\n", language, model, row.join(" | ")));
        }
    }

    out.push_str("\n## Choice distribution\n\n");
    for (choice, count) in &report.choice_distribution {
        let label = if choice.is_empty() { "(none)" } else { choice.as_str() };
        out.push_str(&format!("- {}: {}\n", label, count));
    }

    out
}

/// Paths written by [`write_outputs`].
#[derive(Debug, Clone)]
pub struct ReconcileOutputs {
    pub records: PathBuf,
    pub group_stats: PathBuf,
    pub overall_stats: PathBuf,
    pub summary: PathBuf,
    pub report: PathBuf,
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), ReconcileError> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_outputs(
    out_dir: &Path,
    records: &[EvaluationRecord],
    report: &ReconcileReport,
) -> Result<ReconcileOutputs, ReconcileError> {
    std::fs::create_dir_all(out_dir)?;
    let outputs = ReconcileOutputs {
        records: out_dir.join(DEDUP_FILE),
        group_stats: out_dir.join(GROUP_STATS_FILE),
        overall_stats: out_dir.join(OVERALL_STATS_FILE),
        summary: out_dir.join(SUMMARY_FILE),
        report: out_dir.join(REPORT_FILE),
    };

    write_records(&outputs.records, records)?;
    write_csv(&outputs.group_stats, &report.groups)?;
    write_csv(&outputs.overall_stats, &report.overall)?;

    let summary =
        serde_json::to_string_pretty(report).map_err(|e| ReconcileError::Serde(e.to_string()))?;
    std::fs::write(&outputs.summary, summary)?;
    std::fs::write(&outputs.report, render_report_markdown(report))?;

    info!(dir = %out_dir.display(), records = records.len(), "wrote reconcile outputs");
    Ok(outputs)
}
