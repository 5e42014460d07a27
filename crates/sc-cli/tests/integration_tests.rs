//! End-to-end CLI tests for the offline subcommands.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;

fn config_dir() -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../config")
        .display()
        .to_string()
}

#[test]
fn test_score_file_renders_report() {
    let tmp = tempfile::TempDir::new().unwrap();
    let facts = tmp.path().join("facts.txt");
    std::fs::write(
        &facts,
        "VITALS|Heart Rate|120|Admission\nVITALS|Systolic BP|90|Admission\nLABS|WBC|15|Admission\nVITALS|Respiratory Rate|26|Admission\nVITALS|Temperature|101|Admission\n",
    )
    .unwrap();

    Command::cargo_bin("structcore")
        .unwrap()
        .args([
            "score",
            "file",
            facts.to_str().unwrap(),
            "--config-dir",
            &config_dir(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Readmission Risk Report"))
        .stdout(predicate::str::contains("Sepsis / SIRS Pattern"))
        .stdout(predicate::str::contains("Composite score:"));
}

#[test]
fn test_score_file_json_output() {
    let tmp = tempfile::TempDir::new().unwrap();
    let facts = tmp.path().join("facts.txt");
    std::fs::write(&facts, "DEMOGRAPHICS|Age|82|Admission\n").unwrap();

    let output = Command::cargo_bin("structcore")
        .unwrap()
        .args([
            "--format",
            "json",
            "score",
            "file",
            facts.to_str().unwrap(),
            "--config-dir",
            &config_dir(),
        ])
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON report");
    assert!(value.get("composite_score").is_some());
    assert!(value.get("probability").is_some());
    assert!(value.get("survival_curve").is_some());
}

#[test]
fn test_score_inline_reads_stdin() {
    Command::cargo_bin("structcore")
        .unwrap()
        .args(["score", "inline", "--config-dir", &config_dir()])
        .write_stdin("DISPOSITION|Discharge Disposition|AMA|Discharge\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Unstable Discharge"));
}

#[test]
fn test_score_jsonl_summary() {
    let tmp = tempfile::TempDir::new().unwrap();
    let corpus = tmp.path().join("corpus.jsonl");
    std::fs::write(
        &corpus,
        concat!(
            "{\"hadm_id\": 100, \"completion\": \"VITALS|Heart Rate|130|Admission\"}\n",
            "{\"hadm_id\": 101, \"completion\": \"VITALS|Heart Rate|72|Admission\"}\n",
        ),
    )
    .unwrap();

    Command::cargo_bin("structcore")
        .unwrap()
        .args([
            "score",
            "jsonl",
            corpus.to_str().unwrap(),
            "--config-dir",
            &config_dir(),
            "--summary",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Summary (2 patients)"));
}

#[test]
fn test_unknown_subcommand_fails() {
    Command::cargo_bin("structcore")
        .unwrap()
        .arg("frobnicate")
        .assert()
        .failure();
}

#[test]
fn test_stage1_rejects_unknown_profile() {
    Command::cargo_bin("structcore")
        .unwrap()
        .args([
            "stage1",
            "--cohort-root",
            "does-not-matter",
            "--out-dir",
            "also-ignored",
            "--hadm-ids",
            "1",
            "--profile",
            "sgr_v9",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown stage1 profile"));
}
