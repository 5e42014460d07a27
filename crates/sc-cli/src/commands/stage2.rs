//! Stage-2 command

use crate::cli::CohortArgs;
use crate::output::print_success;
use sc_llm::{ChatClient, Stage2OutputMode, Stage2Scope};
use sc_pipeline::stage2::{Stage2Config, Stage2Runner};
use sc_pipeline::store::{ground_truth_path, write_stage2_summary, ArtifactStore};
use sc_pipeline::Stage2Policy;
use serde_json::Value;

#[derive(Debug, Clone, clap::Args)]
pub struct Stage2Args {
    #[command(flatten)]
    pub cohort: CohortArgs,

    #[arg(long, env = "OPENAI_COMPAT_URL", default_value = "http://127.0.0.1:1234")]
    pub url: String,

    #[arg(long, env = "OPENAI_COMPAT_MODEL_STAGE2", default_value = "medgemma-ft-lora-adapters-q5_k_m")]
    pub model: String,

    #[arg(long, default_value = "768")]
    pub max_tokens: u32,

    #[arg(long, default_value = "0.0")]
    pub temperature: f64,

    /// Default: 1.10 for --scope all, unchanged for objective
    #[arg(long)]
    pub repetition_penalty: Option<f64>,

    #[arg(long)]
    pub top_p: Option<f64>,

    #[arg(long)]
    pub min_p: Option<f64>,

    #[arg(long)]
    pub typical_p: Option<f64>,

    /// Stop sequences (repeatable or comma-separated)
    #[arg(long)]
    pub stop: Vec<String>,

    /// Raw output shape: lines, json
    #[arg(long, env = "STAGE2_OUTPUT_MODE", default_value = "lines")]
    pub output_mode: String,

    /// Cluster scope: objective, all
    #[arg(long, env = "STAGE2_SCOPE", default_value = "objective")]
    pub scope: String,

    #[arg(long)]
    pub require_timestamp_match: bool,

    #[arg(long)]
    pub semantic_keyword_only_match: bool,

    /// Overwrite existing stage2_* outputs
    #[arg(long)]
    pub overwrite_stage2: bool,
}

fn parse_stop_list(stop: &[String]) -> Option<Vec<String>> {
    let out: Vec<String> = stop
        .iter()
        .flat_map(|item| item.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

pub async fn handle(args: Stage2Args) -> anyhow::Result<()> {
    let hadm_ids = args
        .cohort
        .resolve_hadm_ids()
        .map_err(|e| anyhow::anyhow!(e))?;

    let output_mode: Stage2OutputMode = args
        .output_mode
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let scope: Stage2Scope = args.scope.parse().map_err(|e: String| anyhow::anyhow!(e))?;

    let client = ChatClient::new(&args.url, &args.model)?;
    client.ensure_model_available().await?;

    let store = ArtifactStore::new(&args.cohort.out_dir)?;
    let config = Stage2Config {
        output_mode,
        scope,
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        repetition_penalty: args.repetition_penalty,
        top_p: args.top_p,
        min_p: args.min_p,
        typical_p: args.typical_p,
        stop: parse_stop_list(&args.stop),
        require_timestamp_match: args.require_timestamp_match,
        semantic_keyword_only_match: args.semantic_keyword_only_match,
        overwrite: args.overwrite_stage2,
    };
    let runner = Stage2Runner::new(&client, &store, config, Stage2Policy::from_env())?;
    let cohort_root = std::path::Path::new(&args.cohort.cohort_root);
    runner.write_run_meta(cohort_root, &args.url, &args.model)?;

    let mut rows = Vec::new();
    for &hadm_id in &hadm_ids {
        let gt: Option<Value> = {
            let path = ground_truth_path(cohort_root, hadm_id);
            if path.exists() {
                std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|t| serde_json::from_str(&t).ok())
            } else {
                None
            }
        };
        let outcome = runner.run_document(hadm_id, gt.as_ref()).await?;
        if let Some(row) = outcome.summary_row {
            rows.push(row);
        }
    }

    write_stage2_summary(&store, &rows)?;
    print_success(&format!("stage2 complete: {} documents", hadm_ids.len()));
    Ok(())
}
