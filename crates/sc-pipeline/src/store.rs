//! Filesystem layout of per-run artifacts.
//!
//! One run directory holds `hadm_ids.json`, stage-level metadata, a
//! subdirectory per admission id with every intermediate artifact, and the
//! cross-document summaries. Writes are append-or-replace per file; file
//! existence is the idempotence key for resume.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    run_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Result<Self> {
        let run_dir = run_dir.into();
        fs::create_dir_all(&run_dir).context("failed to create run directory")?;
        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn doc_dir(&self, hadm_id: i64) -> PathBuf {
        self.run_dir.join(hadm_id.to_string())
    }

    // -- Per-document artifact paths ------------------------------------

    pub fn stage1_raw_model(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage1_raw_model.txt")
    }

    pub fn stage1_raw(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage1_raw.txt")
    }

    pub fn stage1_raw_try0(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage1_raw_try0.txt")
    }

    pub fn stage1_raw_retry1(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage1_raw_retry1.txt")
    }

    pub fn stage1_raw_retry1_trimmed(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage1_raw_retry1_trimmed.txt")
    }

    pub fn stage1_raw_retry_placeholders(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage1_raw_retry_placeholders.txt")
    }

    pub fn stage1_json(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage1.json")
    }

    pub fn stage1_normalized_json(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage1_normalized.json")
    }

    pub fn stage1_md(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage1.md")
    }

    pub fn stage1_facts(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage1_facts.txt")
    }

    pub fn stage1_meta(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage1_meta.json")
    }

    pub fn stage1_error(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage1_error.json")
    }

    pub fn stage2_raw(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage2_raw.txt")
    }

    pub fn stage2_raw_retry1(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage2_raw_retry1.txt")
    }

    pub fn stage2_facts(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage2_facts.txt")
    }

    pub fn stage2_normalized(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage2_normalized.json")
    }

    pub fn stage2_metrics(&self, hadm_id: i64) -> PathBuf {
        self.doc_dir(hadm_id).join("stage2_metrics.json")
    }

    // -- Resume keys ----------------------------------------------------

    /// Stage 1 is complete when the extracted JSON, the normalized JSON,
    /// and the Markdown all exist.
    pub fn stage1_complete(&self, hadm_id: i64) -> bool {
        self.stage1_json(hadm_id).exists()
            && self.stage1_normalized_json(hadm_id).exists()
            && self.stage1_md(hadm_id).exists()
    }

    pub fn stage2_complete(&self, hadm_id: i64) -> bool {
        self.stage2_metrics(hadm_id).exists()
    }

    // -- IO helpers -----------------------------------------------------

    pub fn write_text(&self, path: &Path, text: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create artifact directory")?;
        }
        fs::write(path, text)
            .with_context(|| format!("failed to write artifact {}", path.display()))
    }

    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let text =
            serde_json::to_string_pretty(value).context("failed to serialize artifact JSON")?;
        self.write_text(path, &text)
    }

    pub fn read_text(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read artifact {}", path.display()))
    }

    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let text = self.read_text(path)?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse artifact {}", path.display()))
    }

    // -- Run-level files ------------------------------------------------

    pub fn hadm_ids_path(&self) -> PathBuf {
        self.run_dir.join("hadm_ids.json")
    }

    pub fn load_hadm_ids(&self) -> Vec<i64> {
        let path = self.hadm_ids_path();
        if !path.exists() {
            return Vec::new();
        }
        self.read_json::<Vec<i64>>(&path).unwrap_or_default()
    }

    /// Record the run's admission ids without ever shrinking an existing
    /// broader list. Single-document reruns must not narrow the run scope.
    pub fn record_hadm_ids(&self, ids: &[i64]) -> Result<Vec<i64>> {
        let existing = self.load_hadm_ids();
        let keep_existing = !existing.is_empty()
            && existing.len() > ids.len()
            && ids.iter().all(|id| existing.contains(id));
        let stable = if keep_existing {
            existing
        } else {
            ids.to_vec()
        };
        self.write_json(&self.hadm_ids_path(), &stable)?;
        Ok(stable)
    }

    pub fn meta_stage1_path(&self) -> PathBuf {
        self.run_dir.join("meta_stage1.json")
    }

    pub fn meta_stage2_path(&self) -> PathBuf {
        self.run_dir.join("meta_stage2.json")
    }

    pub fn summary_stage2_csv(&self) -> PathBuf {
        self.run_dir.join("summary_stage2.csv")
    }

    pub fn summary_stage2_md(&self) -> PathBuf {
        self.run_dir.join("summary_stage2.md")
    }
}

/// One summary row per scored document.
#[derive(Debug, Clone, Serialize)]
pub struct Stage2SummaryRow {
    pub hadm_id: i64,
    pub stage1_json_ok: String,
    pub stage2_lines: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub tp: usize,
    pub fp: usize,
    pub fn_: usize,
    pub downstream_score_nogate: f64,
}

const SUMMARY_COLS: [&str; 10] = [
    "hadm_id",
    "stage1_json_ok",
    "stage2_lines",
    "precision",
    "recall",
    "f1",
    "tp",
    "fp",
    "fn",
    "downstream_score_nogate",
];

impl Stage2SummaryRow {
    fn fields(&self) -> Vec<String> {
        vec![
            self.hadm_id.to_string(),
            self.stage1_json_ok.clone(),
            self.stage2_lines.to_string(),
            format!("{:.4}", self.precision),
            format!("{:.4}", self.recall),
            format!("{:.4}", self.f1),
            self.tp.to_string(),
            self.fp.to_string(),
            self.fn_.to_string(),
            format!("{:.4}", self.downstream_score_nogate),
        ]
    }
}

/// Write the cross-document summary as CSV and a Markdown table.
pub fn write_stage2_summary(store: &ArtifactStore, rows: &[Stage2SummaryRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let mut csv = SUMMARY_COLS.join(",");
    csv.push('\n');
    for row in rows {
        csv.push_str(&row.fields().join(","));
        csv.push('\n');
    }
    store.write_text(&store.summary_stage2_csv(), &csv)?;

    let mut md = String::new();
    md.push_str("| ");
    md.push_str(&SUMMARY_COLS.join(" | "));
    md.push_str(" |\n| ");
    md.push_str(&vec!["---"; SUMMARY_COLS.len()].join(" | "));
    md.push_str(" |\n");
    for row in rows {
        md.push_str("| ");
        md.push_str(&row.fields().join(" | "));
        md.push_str(" |\n");
    }
    store.write_text(&store.summary_stage2_md(), &md)?;
    Ok(())
}

/// Discover admission ids under a cohort root: numeric directories that
/// contain `ehr_<hadm>.txt`, optionally requiring ground truth.
pub fn discover_hadm_ids(cohort_root: &Path, n: usize, require_ground_truth: bool) -> Vec<i64> {
    let mut ids: Vec<i64> = Vec::new();
    let Ok(entries) = fs::read_dir(cohort_root) else {
        return ids;
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    for dir in dirs {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Ok(hadm) = name.parse::<i64>() else { continue };
        let ehr = dir.join(format!("ehr_{hadm}.txt"));
        if !ehr.exists() {
            continue;
        }
        if require_ground_truth && !dir.join(format!("ground_truth_{hadm}.json")).exists() {
            continue;
        }
        ids.push(hadm);
        if n > 0 && ids.len() >= n {
            break;
        }
    }
    ids
}

/// Path of the raw note for an admission.
pub fn ehr_path(cohort_root: &Path, hadm_id: i64) -> PathBuf {
    cohort_root
        .join(hadm_id.to_string())
        .join(format!("ehr_{hadm_id}.txt"))
}

/// Path of the optional ground-truth file for an admission.
pub fn ground_truth_path(cohort_root: &Path, hadm_id: i64) -> PathBuf {
    cohort_root
        .join(hadm_id.to_string())
        .join(format!("ground_truth_{hadm_id}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hadm_ids_stable_superset() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path().join("run")).unwrap();

        let stable = store.record_hadm_ids(&[1, 2, 3]).unwrap();
        assert_eq!(stable, vec![1, 2, 3]);

        // A single-document rerun must not shrink the recorded scope.
        let stable = store.record_hadm_ids(&[2]).unwrap();
        assert_eq!(stable, vec![1, 2, 3]);
        assert_eq!(store.load_hadm_ids(), vec![1, 2, 3]);

        // A broader list replaces it.
        let stable = store.record_hadm_ids(&[1, 2, 3, 4]).unwrap();
        assert_eq!(stable, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_resume_keys() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path().join("run")).unwrap();
        assert!(!store.stage1_complete(101));

        store.write_text(&store.stage1_json(101), "{}").unwrap();
        store
            .write_text(&store.stage1_normalized_json(101), "{}")
            .unwrap();
        assert!(!store.stage1_complete(101));
        store.write_text(&store.stage1_md(101), "## VITALS\n").unwrap();
        assert!(store.stage1_complete(101));

        assert!(!store.stage2_complete(101));
        store.write_text(&store.stage2_metrics(101), "{}").unwrap();
        assert!(store.stage2_complete(101));
    }

    #[test]
    fn test_discover_requires_ehr() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("100")).unwrap();
        fs::write(root.join("100/ehr_100.txt"), "note").unwrap();
        fs::write(root.join("100/ground_truth_100.json"), "[]").unwrap();
        fs::create_dir_all(root.join("101")).unwrap();
        fs::write(root.join("101/ehr_101.txt"), "note").unwrap();
        fs::create_dir_all(root.join("notnum")).unwrap();

        assert_eq!(discover_hadm_ids(root, 0, true), vec![100]);
        assert_eq!(discover_hadm_ids(root, 0, false), vec![100, 101]);
        assert_eq!(discover_hadm_ids(root, 1, false), vec![100]);
    }

    #[test]
    fn test_summary_written() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path().join("run")).unwrap();
        let rows = vec![Stage2SummaryRow {
            hadm_id: 100,
            stage1_json_ok: "yes".into(),
            stage2_lines: 12,
            precision: 0.9,
            recall: 0.8,
            f1: 0.8471,
            tp: 8,
            fp: 1,
            fn_: 2,
            downstream_score_nogate: 0.81,
        }];
        write_stage2_summary(&store, &rows).unwrap();
        let csv = fs::read_to_string(store.summary_stage2_csv()).unwrap();
        assert!(csv.starts_with("hadm_id,"));
        assert!(csv.contains("100,yes,12"));
        let md = fs::read_to_string(store.summary_stage2_md()).unwrap();
        assert!(md.contains("| 100 |"));
    }
}
