//! Sequential per-document orchestration.
//!
//! Stage 1 (base weights) strictly precedes Stage 2 (base + LoRA) strictly
//! precedes risk scoring, per document. Resume-safe: file existence is the
//! idempotence key, and partial artifacts on disk are valid resume points.

use crate::stage1::{Stage1Config, Stage1Runner, Stage1Status};
use crate::stage2::{Stage2Config, Stage2Runner};
use crate::store::{
    ehr_path, ground_truth_path, write_stage2_summary, ArtifactStore, Stage2SummaryRow,
};
use anyhow::{Context, Result};
use sc_engine::{format_report, RiskEngine};
use sc_llm::{LmBackend, LoraControl};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct LoraToggle {
    pub control_url: String,
    pub adapter_id: i64,
    pub stage1_scale: f64,
    pub stage2_scale: f64,
}

impl Default for LoraToggle {
    fn default() -> Self {
        Self {
            control_url: String::new(),
            adapter_id: 0,
            stage1_scale: 0.0,
            stage2_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub cohort_root: PathBuf,
    pub hadm_ids: Vec<i64>,
    pub stage1: Stage1Config,
    pub stage2: Stage2Config,
    pub lora: LoraToggle,
    pub continue_on_error: bool,
    pub sleep_seconds: f64,
    /// Directory with the scoring-rule bundles; `None` skips risk scoring.
    pub config_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingRow {
    pub hadm_id: i64,
    pub status: String,
    pub stage1_s: Option<f64>,
    pub stage2_s: Option<f64>,
    pub total_s: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub ok: usize,
    pub skipped: usize,
    pub failed: usize,
    pub stage1_parse_failures: usize,
}

pub struct Orchestrator<'a, B: LmBackend> {
    stage1_backend: &'a B,
    stage2_backend: &'a B,
    store: &'a ArtifactStore,
    config: RunConfig,
    engine: Option<RiskEngine>,
}

impl<'a, B: LmBackend> Orchestrator<'a, B> {
    pub fn new(
        stage1_backend: &'a B,
        stage2_backend: &'a B,
        store: &'a ArtifactStore,
        config: RunConfig,
    ) -> Result<Self> {
        let engine = match &config.config_dir {
            Some(dir) => Some(RiskEngine::from_config_dir(dir).context("loading rule bundles")?),
            None => None,
        };
        Ok(Self {
            stage1_backend,
            stage2_backend,
            store,
            config,
            engine,
        })
    }

    async fn set_lora(
        &self,
        control: &Option<LoraControl>,
        scale: f64,
        last: &mut Option<f64>,
    ) -> Result<()> {
        let Some(control) = control else { return Ok(()) };
        if last.map(|l| (l - scale).abs() < 1e-9).unwrap_or(false) {
            return Ok(());
        }
        control
            .set_scale(self.config.lora.adapter_id, scale)
            .await
            .context("LoRA adapter toggle failed")?;
        *last = Some(scale);
        Ok(())
    }

    fn read_ground_truth(&self, hadm_id: i64) -> Option<Value> {
        let path = ground_truth_path(&self.config.cohort_root, hadm_id);
        if !path.exists() {
            return None;
        }
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|t| serde_json::from_str(&t).ok())
    }

    fn score_document(&self, hadm_id: i64) -> Result<()> {
        let Some(engine) = &self.engine else {
            return Ok(());
        };
        // A document that never produced Stage-1 artifacts gets no risk
        // output; its directory is self-describing via stage1_error.json.
        let facts_path = self.store.stage2_facts(hadm_id);
        if !facts_path.exists() {
            return Ok(());
        }
        let facts_text = self.store.read_text(&facts_path)?;
        let result = engine.score_text(&facts_text);
        let doc_dir = self.store.doc_dir(hadm_id);
        self.store
            .write_json(&doc_dir.join("risk_report.json"), &result)?;
        self.store.write_text(
            &doc_dir.join("risk_report.txt"),
            &format_report(&result, Some(&hadm_id.to_string())),
        )?;
        Ok(())
    }

    /// Process every document sequentially. Per-document failures stop the
    /// run unless `continue_on_error` is set; the failure is recorded either
    /// way and other documents proceed.
    pub async fn run(&self) -> Result<RunSummary> {
        let hadm_ids = &self.config.hadm_ids;
        let stable = self.store.record_hadm_ids(hadm_ids)?;
        self.store
            .write_json(&self.store.run_dir().join("hadm_ids_sequential.json"), hadm_ids)?;
        self.store
            .write_json(&self.store.run_dir().join("hadm_ids_stable.json"), &stable)?;

        let lora_control = if self.config.lora.control_url.is_empty() {
            None
        } else {
            Some(LoraControl::new(&self.config.lora.control_url)?)
        };
        let mut last_scale: Option<f64> = None;

        let stage1_runner =
            Stage1Runner::new(self.stage1_backend, self.store, self.config.stage1.clone())?;
        let stage2_runner = Stage2Runner::new(
            self.stage2_backend,
            self.store,
            self.config.stage2.clone(),
            crate::policy::Stage2Policy::from_env(),
        )?;

        let mut ok = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;
        let mut stage1_parse_failures = 0usize;
        let mut timings: Vec<TimingRow> = Vec::new();
        let mut rows: Vec<Stage2SummaryRow> = Vec::new();

        for (idx, &hadm_id) in hadm_ids.iter().enumerate() {
            let position = format!("[{}/{}]", idx + 1, hadm_ids.len());

            if self.store.stage2_facts(hadm_id).exists() && !self.config.stage2.overwrite {
                skipped += 1;
                tracing::info!("{position} HADM {hadm_id} | skip (stage2 exists)");
                timings.push(TimingRow {
                    hadm_id,
                    status: "skipped".into(),
                    stage1_s: None,
                    stage2_s: None,
                    total_s: None,
                });
                // Even a skipped document re-asserts the stable id list.
                self.store.record_hadm_ids(&stable)?;
                continue;
            }

            let result: Result<(Option<f64>, Option<f64>)> = async {
                let mut stage1_s: Option<f64> = None;

                let need_stage1 =
                    self.config.stage1.overwrite || !self.store.stage1_md(hadm_id).exists();
                if need_stage1 {
                    self.set_lora(&lora_control, self.config.lora.stage1_scale, &mut last_scale)
                        .await?;
                    let note_path = ehr_path(&self.config.cohort_root, hadm_id);
                    let note = std::fs::read_to_string(&note_path)
                        .with_context(|| format!("missing note {}", note_path.display()))?;
                    let t0 = Instant::now();
                    let outcome = stage1_runner.run_document(hadm_id, &note).await?;
                    stage1_s = Some(t0.elapsed().as_secs_f64());
                    if outcome.status == Stage1Status::Failed {
                        anyhow::bail!("stage1 failed for HADM {hadm_id}");
                    }
                    if !outcome.parse_ok {
                        stage1_parse_failures += 1;
                    }
                } else {
                    tracing::info!("{position} HADM {hadm_id} | reuse stage1.md");
                }

                self.set_lora(&lora_control, self.config.lora.stage2_scale, &mut last_scale)
                    .await?;
                let gt = self.read_ground_truth(hadm_id);
                let t1 = Instant::now();
                let outcome = stage2_runner.run_document(hadm_id, gt.as_ref()).await?;
                let stage2_s = Some(t1.elapsed().as_secs_f64());
                if let Some(row) = outcome.summary_row {
                    rows.push(row);
                }

                self.score_document(hadm_id)?;
                Ok((stage1_s, stage2_s))
            }
            .await;

            match result {
                Ok((stage1_s, stage2_s)) => {
                    ok += 1;
                    tracing::info!("{position} HADM {hadm_id} | done");
                    timings.push(TimingRow {
                        hadm_id,
                        status: "ok".into(),
                        stage1_s,
                        stage2_s,
                        total_s: Some(
                            stage1_s.unwrap_or(0.0) + stage2_s.unwrap_or(0.0),
                        ),
                    });
                }
                Err(err) => {
                    failed += 1;
                    tracing::error!("{position} HADM {hadm_id} | FAILED: {err:#}");
                    timings.push(TimingRow {
                        hadm_id,
                        status: "failed".into(),
                        stage1_s: None,
                        stage2_s: None,
                        total_s: None,
                    });
                    if !self.config.continue_on_error {
                        self.write_run_outputs(&timings, &rows)?;
                        return Err(err);
                    }
                }
            }

            self.store.record_hadm_ids(&stable)?;
            if self.config.sleep_seconds > 0.0 {
                tokio::time::sleep(std::time::Duration::from_secs_f64(self.config.sleep_seconds))
                    .await;
            }
        }

        self.write_run_outputs(&timings, &rows)?;

        let summary = RunSummary {
            total: hadm_ids.len(),
            ok,
            skipped,
            failed,
            stage1_parse_failures,
        };
        self.store.write_json(
            &self.store.run_dir().join("summary_two_stage_sequential.json"),
            &serde_json::json!({
                "ts": chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
                "total": summary.total,
                "ok": summary.ok,
                "skipped": summary.skipped,
                "failed": summary.failed,
                "cohort_root": self.config.cohort_root.display().to_string(),
                "out_dir": self.store.run_dir().display().to_string(),
                "stage1_profile": self.config.stage1.profile.as_str(),
                "stage2_scope": self.config.stage2.scope.as_str(),
                "lora_control_url": &self.config.lora.control_url,
                "lora_adapter_id": self.config.lora.adapter_id,
                "lora_stage1_scale": self.config.lora.stage1_scale,
                "lora_stage2_scale": self.config.lora.stage2_scale,
            }),
        )?;
        Ok(summary)
    }

    fn write_run_outputs(&self, timings: &[TimingRow], rows: &[Stage2SummaryRow]) -> Result<()> {
        let mut csv = String::from("hadm_id,status,stage1_s,stage2_s,total_s\n");
        for row in timings {
            let fmt = |v: Option<f64>| v.map(|s| format!("{s:.3}")).unwrap_or_default();
            csv.push_str(&format!(
                "{},{},{},{},{}\n",
                row.hadm_id,
                row.status,
                fmt(row.stage1_s),
                fmt(row.stage2_s),
                fmt(row.total_s)
            ));
        }
        self.store.write_text(
            &self.store.run_dir().join("timings_two_stage_sequential.csv"),
            &csv,
        )?;
        write_stage2_summary(self.store, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_llm::prompts::Stage1Profile;
    use sc_llm::MockBackend;
    use tempfile::TempDir;

    fn stage1_response() -> String {
        serde_json::json!({
            "DEMOGRAPHICS": "Sex=female\nAge=72",
            "VITALS": "ADM: Heart Rate=88",
            "LABS": "ADM: WBC=7.7",
            "PROBLEMS": {"pmh_comorbidities": ["Hypertension"], "discharge_dx": [],
                          "complications": [], "working_dx": []},
            "SYMPTOMS": {"admission": [], "discharge": []},
            "MEDICATIONS": "not stated",
            "PROCEDURES": "not stated",
            "UTILIZATION": "not stated",
            "DISPOSITION": "Discharge Disposition=Home\nMental Status=alert"
        })
        .to_string()
    }

    fn run_config(tmp: &TempDir, overwrite: bool) -> RunConfig {
        let schemas = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../schemas");
        let config_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config");
        RunConfig {
            cohort_root: tmp.path().join("cohort"),
            hadm_ids: vec![300],
            stage1: Stage1Config {
                profile: Stage1Profile::SgrV2,
                schema_path: schemas.join("readmission_domain_summary_sgr_v2.schema.json"),
                max_tokens: 1536,
                temperature: 0.0,
                overwrite,
            },
            stage2: Stage2Config {
                scope: sc_llm::Stage2Scope::All,
                overwrite,
                ..Stage2Config::default()
            },
            lora: LoraToggle::default(),
            continue_on_error: false,
            sleep_seconds: 0.0,
            config_dir: Some(config_dir),
        }
    }

    fn seed_cohort(tmp: &TempDir) {
        let doc = tmp.path().join("cohort/300");
        std::fs::create_dir_all(&doc).unwrap();
        std::fs::write(doc.join("ehr_300.txt"), "72F with hypertension, HR 88.").unwrap();
    }

    #[tokio::test]
    async fn test_full_document_flow_with_risk_report() {
        let tmp = TempDir::new().unwrap();
        seed_cohort(&tmp);
        let store = ArtifactStore::new(tmp.path().join("run")).unwrap();

        let backend = MockBackend::with_responses(vec![
            stage1_response(),
            "VITALS|Heart Rate|88|Admission\nPROBLEMS|Hypertension|chronic|Past\nEND".to_string(),
        ]);
        let orch = Orchestrator::new(&backend, &backend, &store, run_config(&tmp, false)).unwrap();
        let summary = orch.run().await.unwrap();
        assert_eq!(summary.ok, 1);
        assert_eq!(summary.failed, 0);

        assert!(store.stage1_md(300).exists());
        assert!(store.stage2_facts(300).exists());
        let report = std::fs::read_to_string(store.doc_dir(300).join("risk_report.txt")).unwrap();
        assert!(report.contains("Readmission Risk Report"));
        assert!(store.run_dir().join("summary_two_stage_sequential.json").exists());
        assert!(store
            .run_dir()
            .join("timings_two_stage_sequential.csv")
            .exists());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        seed_cohort(&tmp);
        let store = ArtifactStore::new(tmp.path().join("run")).unwrap();

        let backend = MockBackend::with_responses(vec![
            stage1_response(),
            "VITALS|Heart Rate|88|Admission\nEND".to_string(),
        ]);
        let orch = Orchestrator::new(&backend, &backend, &store, run_config(&tmp, false)).unwrap();
        orch.run().await.unwrap();
        let report_before =
            std::fs::read_to_string(store.doc_dir(300).join("risk_report.json")).unwrap();

        // Second run: no backend calls, identical risk result.
        let backend2 = MockBackend::new();
        let orch2 =
            Orchestrator::new(&backend2, &backend2, &store, run_config(&tmp, false)).unwrap();
        let summary = orch2.run().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(backend2.call_count(), 0);
        let report_after =
            std::fs::read_to_string(store.doc_dir(300).join("risk_report.json")).unwrap();
        assert_eq!(report_before, report_after);
    }
}
