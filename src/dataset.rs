//! Question loading and per-language sample draws.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One question drawn from a labeled dataset file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationSample {
    /// File name (not path) the row came from.
    pub source_file: String,
    /// 0-based data-row index within `source_file`.
    pub row_index: u64,
    pub question: String,
    /// Choice label (`A`..`D`) to option text; only non-empty options are kept.
    pub options: BTreeMap<String, String>,
    /// Trimmed, upper-cased answer.
    pub ground_truth: String,
    pub category: String,
}

impl EvaluationSample {
    pub fn has_options(&self) -> bool {
        !self.options.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceReadError {
    #[error("failed to read {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} is missing required column '{column}'")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("failed to list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

const OPTION_LABELS: [&str; 4] = ["A", "B", "C", "D"];

const CATEGORY_KEYWORDS: [(&str, char); 6] = [
    ("quantitative", 'Q'),
    ("定量", 'Q'),
    ("logical", 'L'),
    ("逻辑", 'L'),
    ("commonsense", 'C'),
    ("常识", 'C'),
];

/// Reduce a free-text category to ordered short labels (`Q`, `L`, `C`) joined by `&`.
///
/// Returns `UNKNOWN` when nothing is recognized.
pub fn normalize_category(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let mut found = [false; 3];
    let slot = |label: char| match label {
        'Q' => 0,
        'L' => 1,
        _ => 2,
    };

    for (keyword, label) in CATEGORY_KEYWORDS {
        if lower.contains(keyword) {
            found[slot(label)] = true;
        }
    }
    for token in lower.split(|c: char| !c.is_alphanumeric()) {
        match token {
            "q" => found[0] = true,
            "l" => found[1] = true,
            "c" => found[2] = true,
            _ => {}
        }
    }

    let labels: Vec<&str> = ["Q", "L", "C"]
        .iter()
        .zip(found)
        .filter_map(|(label, hit)| hit.then_some(*label))
        .collect();
    if labels.is_empty() {
        "UNKNOWN".to_string()
    } else {
        labels.join("&")
    }
}

struct Columns {
    question: usize,
    answer: usize,
    category: Option<usize>,
    options: Vec<(&'static str, usize)>,
}

impl Columns {
    fn resolve(path: &Path, headers: &csv::StringRecord) -> Result<Self, SourceReadError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim_start_matches('\u{feff}').trim() == name)
        };
        let question = find("Question").ok_or_else(|| SourceReadError::MissingColumn {
            path: path.to_path_buf(),
            column: "Question",
        })?;
        let answer = find("Answer").ok_or_else(|| SourceReadError::MissingColumn {
            path: path.to_path_buf(),
            column: "Answer",
        })?;
        let options = OPTION_LABELS
            .iter()
            .filter_map(|label| find(label).map(|idx| (*label, idx)))
            .collect();

        Ok(Self {
            question,
            answer,
            category: find("Category"),
            options,
        })
    }
}

/// Load every row of one CSV file as a sample.
pub fn load_file(path: &Path) -> Result<Vec<EvaluationSample>, SourceReadError> {
    let csv_err = |source| SourceReadError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;
    let headers = reader.headers().map_err(csv_err)?.clone();
    let columns = Columns::resolve(path, &headers)?;

    let source_file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut samples = Vec::new();
    for (row_index, row) in reader.records().enumerate() {
        let row = row.map_err(csv_err)?;
        let cell = |idx: usize| row.get(idx).unwrap_or_default().trim().to_string();

        let options = columns
            .options
            .iter()
            .map(|(label, idx)| (label.to_string(), cell(*idx)))
            .filter(|(_, text)| !text.is_empty())
            .collect();

        samples.push(EvaluationSample {
            source_file: source_file.clone(),
            row_index: row_index as u64,
            question: cell(columns.question),
            options,
            ground_truth: cell(columns.answer).to_uppercase(),
            category: columns.category.map(cell).unwrap_or_default(),
        });
    }

    Ok(samples)
}

/// CSV files in a directory, sorted by file name.
pub fn list_dataset_files(dir: &Path) -> Result<Vec<PathBuf>, SourceReadError> {
    let io_err = |source| SourceReadError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|e| e.eq_ignore_ascii_case("csv"))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Load the whole pool for one language directory, shuffle it, and keep `max_samples`.
///
/// Unreadable files are logged and skipped.
pub fn collect_samples<R: Rng + ?Sized>(
    language_dir: &Path,
    max_samples: usize,
    rng: &mut R,
) -> Vec<EvaluationSample> {
    let files = match list_dataset_files(language_dir) {
        Ok(files) => files,
        Err(err) => {
            warn!(error = %err, "dataset directory unavailable; no samples collected");
            return Vec::new();
        }
    };

    let mut pool = Vec::new();
    for path in files {
        match load_file(&path) {
            Ok(rows) => pool.extend(rows),
            Err(err) => warn!(error = %err, "skipping unreadable dataset file"),
        }
    }

    let pool_size = pool.len();
    pool.shuffle(rng);
    pool.truncate(max_samples);
    info!(
        dir = %language_dir.display(),
        pool = pool_size,
        drawn = pool.len(),
        "collected samples"
    );
    pool
}
