use std::collections::BTreeMap;
use std::io::Write;

use cot_harness::dataset::EvaluationSample;
use cot_harness::interpret::parse_response;
use cot_harness::record::{EvaluationRecord, RecordKey};
use cot_harness::store::{dedup_latest, load_records, resume_set, RecordLog, StoreError};
use tempfile::tempdir;

fn record(file: &str, row: u64, strategy: &str, output: &str) -> EvaluationRecord {
    let sample = EvaluationSample {
        source_file: file.to_string(),
        row_index: row,
        question: format!("q{row}"),
        options: BTreeMap::new(),
        ground_truth: "C".to_string(),
        category: "L".to_string(),
    };
    EvaluationRecord::from_outcome(
        &sample,
        "model-x",
        "en",
        strategy,
        output.to_string(),
        parse_response(output),
    )
}

#[test]
fn appended_records_round_trip_through_the_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("results.jsonl");

    let mut log = RecordLog::open(&path).unwrap();
    let verdict = r#"{"choice":"C","reason":"r","self_judgment":"correct"}"#;
    log.append(&record("a.csv", 0, "zero_shot", verdict)).unwrap();
    log.append(&record("a.csv", 1, "zero_shot", "garbled C output"))
        .unwrap();
    drop(log);

    let loaded = load_records(&path).unwrap();
    assert_eq!(loaded.len(), 2);
    assert!(loaded[0].is_correct);
    assert!(loaded[1].parse_error);
    assert_eq!(loaded[1].predicted_choice, "C");
    for rec in &loaded {
        let expected = !rec.predicted_choice.is_empty()
            && rec.predicted_choice.to_uppercase() == rec.standard_answer.to_uppercase();
        assert_eq!(rec.is_correct, expected);
    }
}

#[test]
fn resume_set_skips_corrupt_lines_and_missing_files() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("results.jsonl");
    assert!(resume_set(&path).unwrap().is_empty());

    {
        let mut log = RecordLog::open(&path).unwrap();
        log.append(&record("a.csv", 3, "few_shot", "{}")).unwrap();
    }
    // A crash mid-write leaves a truncated trailing line.
    let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(b"{\"model\":\"model-x\",\"lang").unwrap();
    drop(f);

    let keys = resume_set(&path).unwrap();
    assert_eq!(keys.len(), 1);
    assert!(keys.contains(&RecordKey::new("model-x", "en", "few_shot", "a.csv", 3)));
}

#[test]
fn append_after_truncated_tail_keeps_both_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("results.jsonl");
    {
        let mut log = RecordLog::open(&path).unwrap();
        log.append(&record("a.csv", 0, "zero_shot", "{}")).unwrap();
    }
    let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(b"{\"model\":\"m\",\"lang").unwrap();
    drop(f);

    {
        let mut log = RecordLog::open(&path).unwrap();
        log.append(&record("a.csv", 1, "zero_shot", "{}")).unwrap();
    }

    let rows: Vec<u64> = load_records(&path)
        .unwrap()
        .iter()
        .map(|r| r.row_index)
        .collect();
    assert_eq!(rows, vec![0, 1]);
    assert_eq!(resume_set(&path).unwrap().len(), 2);
}

#[test]
fn dedup_is_idempotent_and_last_wins() {
    let records = vec![
        record("b.csv", 0, "zero_shot", "first"),
        record("a.csv", 0, "zero_shot", "keep"),
        record("b.csv", 0, "zero_shot", "second"),
        record("b.csv", 0, "few_shot", "other strategy"),
        record("b.csv", 0, "zero_shot", "third"),
    ];

    let once = dedup_latest(records);
    let twice = dedup_latest(once.clone());
    assert_eq!(once, twice);
    assert_eq!(once.len(), 3);

    let b_zero = once
        .iter()
        .find(|r| r.file == "b.csv" && r.strategy == "zero_shot")
        .unwrap();
    assert_eq!(b_zero.model_raw_output, "third");

    let keys: Vec<RecordKey> = once.iter().map(EvaluationRecord::key).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}

#[test]
fn readers_see_the_log_while_a_writer_holds_it() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("results.jsonl");
    let mut log = RecordLog::open(&path).unwrap();
    log.append(&record("a.csv", 0, "zero_shot", "{}")).unwrap();

    assert_eq!(load_records(&path).unwrap().len(), 1);
    assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
}

#[test]
fn only_one_writer_per_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("results.jsonl");
    let _held = RecordLog::open(&path).unwrap();
    match RecordLog::open(&path) {
        Err(StoreError::Locked(p)) => assert_eq!(p, path),
        other => panic!("expected lock failure, got {other:?}"),
    }
}
