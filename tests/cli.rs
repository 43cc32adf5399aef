//! CLI test cases.
//!
//! End-to-end runs use a small shell script standing in for the real OCR
//! engine, so no Tesseract or Python installation is needed. The script
//! receives the image path and the JSON request exactly like a real engine
//! and prints a canned reply.

use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("dualscan").unwrap()
}

/// Write an executable engine stub and return its path.
fn stub_engine(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("engine.sh");
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema_engine_request() {
    cmd()
        .arg("schema")
        .arg("EngineRequest")
        .assert()
        .success()
        .stdout(predicate::str::contains("performancePreset"))
        .stdout(predicate::str::contains("psm1"));
}

#[test]
fn test_schema_consensus_result() {
    cmd()
        .arg("schema")
        .arg("ConsensusResult")
        .assert()
        .success()
        .stdout(predicate::str::contains("consensus_source"))
        .stdout(predicate::str::contains("bounding_boxes"));
}

#[test]
fn test_process_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    fs::create_dir(&images).unwrap();
    fs::write(images.join("a.png"), b"fake scan a").unwrap();
    fs::write(images.join("b.png"), b"fake scan b").unwrap();

    let engine = stub_engine(
        dir.path(),
        r#"echo '{"success": true, "pytesseract_text": "alpha", "pytesseract_confidence": 80, "easyocr_text": "alpha beta", "easyocr_confidence": 90}'"#,
    );
    let out = dir.path().join("out.jsonl");

    cmd()
        .arg("process")
        .arg(&images)
        .arg("--no-preprocessing")
        .arg("--jobs")
        .arg("2")
        .arg("-o")
        .arg(&out)
        .arg("--")
        .arg(&engine)
        .assert()
        .success();

    let output = fs::read_to_string(&out).unwrap();
    let records: Vec<serde_json::Value> = output
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], "a.png");
    assert_eq!(records[1]["id"], "b.png");
    for record in &records {
        assert_eq!(record["status"], "completed");
        // The second pass had the strictly higher confidence.
        assert_eq!(record["result"]["consensus_text"], "alpha beta");
        assert_eq!(record["result"]["consensus_confidence"], 90);
        assert_eq!(record["result"]["consensus_source"], "pass2");
    }
}

#[test]
fn test_process_fails_when_the_engine_fails() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    fs::create_dir(&images).unwrap();
    fs::write(images.join("a.png"), b"fake scan").unwrap();

    let engine = stub_engine(dir.path(), "echo 'engine exploded' >&2; exit 1");
    let out = dir.path().join("out.jsonl");

    cmd()
        .arg("process")
        .arg(&images)
        .arg("--no-preprocessing")
        .arg("-o")
        .arg(&out)
        .arg("--")
        .arg(&engine)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed OCR"));

    // The failing image still gets a record with its error.
    let output = fs::read_to_string(&out).unwrap();
    let record: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
    assert_eq!(record["status"], "failed");
    assert!(
        record["error"]
            .as_str()
            .unwrap()
            .contains("engine exploded")
    );
}

#[test]
fn test_process_tolerates_failures_within_the_allowed_rate() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    fs::create_dir(&images).unwrap();
    fs::write(images.join("good.png"), b"fake scan").unwrap();
    fs::write(images.join("zz-bad.png"), b"broken").unwrap();

    // The engine only ever sees a temp copy of the image, so the stub keys
    // its behavior off the image bytes rather than the path.
    let engine = stub_engine(
        dir.path(),
        r#"if grep -q broken "$1" 2>/dev/null; then
  exit 1
fi
echo '{"success": true, "pytesseract_text": "ok", "pytesseract_confidence": 70, "easyocr_text": "ok", "easyocr_confidence": 70}'"#,
    );

    cmd()
        .arg("process")
        .arg(&images)
        .arg("--no-preprocessing")
        .arg("--allowed-failure-rate")
        .arg("0.5")
        .arg("-o")
        .arg(dir.path().join("out.jsonl"))
        .arg("--")
        .arg(&engine)
        .assert()
        .success();
}

#[test]
fn test_process_rejects_an_empty_directory() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    fs::create_dir(&images).unwrap();
    let engine = stub_engine(dir.path(), "exit 0");

    cmd()
        .arg("process")
        .arg(&images)
        .arg("--")
        .arg(&engine)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no images found"));
}
