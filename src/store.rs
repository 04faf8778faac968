//! Append-only JSONL record log with resume and dedup support.

use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use fs2::FileExt;
use tracing::{info, warn};

use crate::record::{EvaluationRecord, RecordKey};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("log {0} is held by another writer")]
    Locked(PathBuf),
}

/// Exclusive append handle on a record log.
///
/// The advisory lock lives on a `<log>.lock` sidecar, never on the log itself,
/// and is held for the life of the handle.
#[derive(Debug)]
pub struct RecordLog {
    path: PathBuf,
    file: File,
    lock: File,
}

impl RecordLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path(&path))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(path));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if ends_mid_line(&mut file)? {
            warn!(path = %path.display(), "log ends in a partial line; terminating it");
            file.write_all(b"\n")?;
            file.flush()?;
        }
        Ok(Self { path, file, lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one record as a single line and flush it.
    pub fn append(&mut self, record: &EvaluationRecord) -> Result<(), StoreError> {
        let mut line =
            serde_json::to_string(record).map_err(|e| StoreError::Serde(e.to_string()))?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for RecordLog {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock);
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// True when a non-empty file does not end with a newline.
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Read every decodable record; undecodable lines are skipped with a warning.
pub fn load_records(path: &Path) -> Result<Vec<EvaluationRecord>, StoreError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    let mut skipped = 0usize;

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EvaluationRecord>(&line) {
            Ok(rec) => records.push(rec),
            Err(err) => {
                skipped += 1;
                warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %err,
                    "skipping undecodable log line"
                );
            }
        }
    }

    if skipped > 0 {
        info!(path = %path.display(), loaded = records.len(), skipped, "loaded record log");
    }
    Ok(records)
}

/// Keys already present in the log. A missing log yields an empty set.
pub fn resume_set(path: &Path) -> Result<HashSet<RecordKey>, StoreError> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    Ok(load_records(path)?.iter().map(EvaluationRecord::key).collect())
}

/// Keep the last occurrence per key, sorted by key.
pub fn dedup_latest(records: Vec<EvaluationRecord>) -> Vec<EvaluationRecord> {
    let mut latest: BTreeMap<RecordKey, EvaluationRecord> = BTreeMap::new();
    for rec in records {
        latest.insert(rec.key(), rec);
    }
    latest.into_values().collect()
}

pub fn write_records(path: &Path, records: &[EvaluationRecord]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    for rec in records {
        let line = serde_json::to_string(rec).map_err(|e| StoreError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Outcome of an in-place dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupOutcome {
    pub before: usize,
    pub after: usize,
    pub backup: Option<PathBuf>,
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(format!(".bak.{}", Local::now().format("%Y%m%d%H%M%S")));
    PathBuf::from(name)
}

/// Deduplicate `src` into `dest`, or in place with a timestamped backup when `dest` is `None`.
pub fn rewrite_deduplicated(src: &Path, dest: Option<&Path>) -> Result<DedupOutcome, StoreError> {
    let records = load_records(src)?;
    let before = records.len();
    let deduped = dedup_latest(records);
    let after = deduped.len();

    let backup = match dest {
        Some(dest) => {
            write_records(dest, &deduped)?;
            None
        }
        None => {
            let backup = backup_path(src);
            std::fs::copy(src, &backup)?;
            let mut tmp: OsString = src.as_os_str().to_owned();
            tmp.push(".tmp");
            let tmp = PathBuf::from(tmp);
            write_records(&tmp, &deduped)?;
            std::fs::rename(&tmp, src)?;
            Some(backup)
        }
    };

    info!(before, after, removed = before - after, "deduplicated record log");
    Ok(DedupOutcome {
        before,
        after,
        backup,
    })
}
