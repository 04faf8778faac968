//! Evaluation records and their composite identity.

use serde::{Deserialize, Serialize};

use crate::dataset::EvaluationSample;
use crate::interpret::{extract_standalone_letter, ParseOutcome};

/// Prefix of the raw output stored when every invocation attempt failed.
pub const API_ERROR_SENTINEL: &str = "API_ERROR";

/// Build the raw-output sentinel for an exhausted invocation.
pub fn api_error_output(message: impl std::fmt::Display) -> String {
    format!("{API_ERROR_SENTINEL}: {message}")
}

/// Whether a raw output is an invocation-failure sentinel.
pub fn is_api_error_output(raw: &str) -> bool {
    raw.trim_start()
        .to_ascii_lowercase()
        .starts_with(&API_ERROR_SENTINEL.to_ascii_lowercase())
}

/// Identity of one logical evaluation unit across re-runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub model: String,
    pub language: String,
    pub strategy: String,
    pub file: String,
    pub row_index: u64,
}

impl RecordKey {
    pub fn new(
        model: impl Into<String>,
        language: impl Into<String>,
        strategy: impl Into<String>,
        file: impl Into<String>,
        row_index: u64,
    ) -> Self {
        Self {
            model: model.into(),
            language: language.into(),
            strategy: strategy.into(),
            file: file.into(),
            row_index,
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}#{}",
            self.model, self.language, self.strategy, self.file, self.row_index
        )
    }
}

/// One line of the evaluation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub model: String,
    pub language: String,
    pub strategy: String,
    pub file: String,
    pub row_index: u64,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub standard_answer: String,
    #[serde(default)]
    pub model_raw_output: String,
    #[serde(default)]
    pub parse_error: bool,
    #[serde(default)]
    pub parse_error_msg: String,
    #[serde(default)]
    pub predicted_choice: String,
    #[serde(default)]
    pub predicted_reason: String,
    #[serde(default)]
    pub predicted_self_judgment: String,
    #[serde(default)]
    pub reason_length: usize,
    #[serde(default)]
    pub is_correct: bool,
    #[serde(default)]
    pub category: String,
}

/// `true` only for a non-empty choice matching the ground truth, ignoring case.
pub fn is_correct(predicted_choice: &str, ground_truth: &str) -> bool {
    let choice = predicted_choice.trim();
    !choice.is_empty() && choice.to_uppercase() == ground_truth.trim().to_uppercase()
}

impl EvaluationRecord {
    /// Build the record for one sample from the interpreter outcome.
    pub fn from_outcome(
        sample: &EvaluationSample,
        model: &str,
        language: &str,
        strategy: &str,
        raw_output: String,
        outcome: ParseOutcome,
    ) -> Self {
        let mut record = Self {
            model: model.to_string(),
            language: language.to_string(),
            strategy: strategy.to_string(),
            file: sample.source_file.clone(),
            row_index: sample.row_index,
            question: sample.question.clone(),
            standard_answer: sample.ground_truth.clone(),
            model_raw_output: String::new(),
            parse_error: false,
            parse_error_msg: String::new(),
            predicted_choice: String::new(),
            predicted_reason: String::new(),
            predicted_self_judgment: String::new(),
            reason_length: 0,
            is_correct: false,
            category: sample.category.clone(),
        };

        match outcome {
            ParseOutcome::Parsed(judgment) => {
                record.predicted_choice = judgment.choice;
                record.predicted_reason = judgment.reason;
                record.predicted_self_judgment = judgment.self_judgment;
            }
            ParseOutcome::Failed { message, .. } => {
                record.parse_error = true;
                record.parse_error_msg = message;
                if !is_api_error_output(&raw_output) {
                    record.predicted_choice =
                        extract_standalone_letter(&raw_output.to_uppercase()).unwrap_or_default();
                }
            }
        }

        record.model_raw_output = raw_output;
        record.recompute_derived();
        record
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(
            &self.model,
            &self.language,
            &self.strategy,
            &self.file,
            self.row_index,
        )
    }

    /// Recompute `is_correct` and `reason_length` from the stored fields.
    pub fn recompute_derived(&mut self) {
        self.is_correct = is_correct(&self.predicted_choice, &self.standard_answer);
        self.reason_length = self.predicted_reason.chars().count();
    }

    pub fn is_api_error(&self) -> bool {
        is_api_error_output(&self.model_raw_output)
    }

    /// Self-judgment matches computed correctness; non-canonical values never match.
    pub fn self_judgment_agrees(&self) -> bool {
        match self.predicted_self_judgment.as_str() {
            "correct" => self.is_correct,
            "incorrect" => !self.is_correct,
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::interpret::{parse_response, Judgment};
    use std::collections::BTreeMap;

    pub(crate) fn sample(file: &str, row: u64, answer: &str) -> EvaluationSample {
        EvaluationSample {
            source_file: file.to_string(),
            row_index: row,
            question: format!("question {row}"),
            options: BTreeMap::new(),
            ground_truth: answer.to_string(),
            category: "Q".to_string(),
        }
    }

    #[test]
    fn correctness_requires_non_empty_choice() {
        assert!(is_correct("a", "A"));
        assert!(is_correct("B", " b "));
        assert!(!is_correct("", ""));
        assert!(!is_correct("C", "D"));
    }

    #[test]
    fn parsed_outcome_populates_fields() {
        let s = sample("topic.csv", 3, "B");
        let outcome = ParseOutcome::Parsed(Judgment {
            choice: "B".into(),
            reason: "because".into(),
            self_judgment: "correct".into(),
        });
        let rec = EvaluationRecord::from_outcome(&s, "m", "zh", "zero_shot", "{}".into(), outcome);
        assert!(rec.is_correct);
        assert_eq!(rec.reason_length, 7);
        assert!(!rec.parse_error);
        assert!(rec.self_judgment_agrees());
        assert_eq!(rec.key(), RecordKey::new("m", "zh", "zero_shot", "topic.csv", 3));
    }

    #[test]
    fn broken_json_falls_back_to_letter() {
        let s = sample("topic.csv", 0, "A");
        let raw = "I think the answer is A but json broke".to_string();
        let outcome = parse_response(&raw);
        let rec = EvaluationRecord::from_outcome(&s, "m", "en", "few_shot", raw, outcome);
        assert!(rec.parse_error);
        assert!(!rec.parse_error_msg.is_empty());
        assert_eq!(rec.predicted_choice, "A");
        assert!(rec.is_correct);
    }

    #[test]
    fn api_error_sentinel_skips_letter_fallback() {
        let s = sample("topic.csv", 0, "A");
        let raw = api_error_output("HTTP 500: A server error");
        let outcome = parse_response(&raw);
        let rec = EvaluationRecord::from_outcome(&s, "m", "en", "few_shot", raw, outcome);
        assert!(rec.parse_error);
        assert!(rec.is_api_error());
        assert_eq!(rec.predicted_choice, "");
        assert!(!rec.is_correct);
    }

    #[test]
    fn non_canonical_self_judgment_never_agrees() {
        let s = sample("topic.csv", 0, "A");
        let outcome = ParseOutcome::Parsed(Judgment {
            choice: "A".into(),
            reason: String::new(),
            self_judgment: "probably correct".into(),
        });
        let rec = EvaluationRecord::from_outcome(&s, "m", "en", "few_shot", "{}".into(), outcome);
        assert!(rec.is_correct);
        assert!(!rec.self_judgment_agrees());
    }

    #[test]
    fn record_reads_lines_with_missing_optional_fields() {
        let line = r#"{"model":"m","language":"zh","strategy":"zero_shot","file":"f.csv","row_index":2,"extra":1}"#;
        let rec: EvaluationRecord = serde_json::from_str(line).unwrap();
        assert_eq!(rec.row_index, 2);
        assert!(!rec.parse_error);
        assert_eq!(rec.predicted_choice, "");
    }
}
