//! Sequential per-document run command

use crate::cli::CohortArgs;
use crate::commands::{resolve_profile, resolve_schema_path};
use crate::output::print_success;
use sc_llm::{ChatClient, Stage2OutputMode, Stage2Scope};
use sc_pipeline::orchestrate::{LoraToggle, Orchestrator, RunConfig};
use sc_pipeline::stage1::Stage1Config;
use sc_pipeline::stage2::Stage2Config;
use sc_pipeline::store::ArtifactStore;
use std::path::PathBuf;

#[derive(Debug, Clone, clap::Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub cohort: CohortArgs,

    #[arg(long, env = "OPENAI_COMPAT_URL", default_value = "http://127.0.0.1:1234")]
    pub stage1_url: String,

    #[arg(long, env = "OPENAI_COMPAT_MODEL_STAGE1", default_value = "medgemma-base-q5_k_m")]
    pub stage1_model: String,

    #[arg(long, env = "STAGE1_PROFILE", default_value = "sgr_v2")]
    pub stage1_profile: String,

    #[arg(long, default_value = crate::commands::DEFAULT_SCHEMA_PATH)]
    pub schema_path: String,

    #[arg(long, env = "STAGE1_MAX_TOKENS", default_value = "1536")]
    pub stage1_max_tokens: u32,

    #[arg(long, default_value = "0.0")]
    pub stage1_temperature: f64,

    #[arg(long, env = "OPENAI_COMPAT_URL", default_value = "http://127.0.0.1:1234")]
    pub stage2_url: String,

    #[arg(long, env = "OPENAI_COMPAT_MODEL_STAGE2", default_value = "medgemma-ft-lora-adapters-q5_k_m")]
    pub stage2_model: String,

    #[arg(long, default_value = "768")]
    pub stage2_max_tokens: u32,

    #[arg(long, default_value = "0.0")]
    pub stage2_temperature: f64,

    /// Override Stage-2 repetition penalty (default: 1.10 for scope all)
    #[arg(long)]
    pub stage2_repetition_penalty: Option<f64>,

    #[arg(long, default_value = "all")]
    pub stage2_scope: String,

    #[arg(long)]
    pub overwrite_stage1: bool,

    #[arg(long)]
    pub overwrite_stage2: bool,

    /// llama-server LoRA control URL for single-backend runs
    #[arg(long, default_value = "")]
    pub lora_control_url: String,

    #[arg(long, default_value = "0")]
    pub lora_adapter_id: i64,

    /// Adapter scale before Stage 1 (0 = base-only)
    #[arg(long, default_value = "0.0")]
    pub lora_stage1_scale: f64,

    /// Adapter scale before Stage 2
    #[arg(long, default_value = "1.0")]
    pub lora_stage2_scale: f64,

    /// Directory with scoring_rules.json and the concept group bundles
    #[arg(long, default_value = "config")]
    pub config_dir: String,

    #[arg(long, default_value = "0.0")]
    pub sleep_seconds: f64,

    /// Keep going after a failed document
    #[arg(long)]
    pub continue_on_error: bool,
}

pub async fn handle(args: RunArgs) -> anyhow::Result<()> {
    let hadm_ids = args
        .cohort
        .resolve_hadm_ids()
        .map_err(|e| anyhow::anyhow!(e))?;

    let profile = resolve_profile(&args.stage1_profile)?;
    let schema_path = resolve_schema_path(&args.schema_path, profile);
    let scope: Stage2Scope = args
        .stage2_scope
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let stage1_client = ChatClient::new(&args.stage1_url, &args.stage1_model)?;
    stage1_client.ensure_model_available().await?;
    let stage2_client = ChatClient::new(&args.stage2_url, &args.stage2_model)?;

    let store = ArtifactStore::new(&args.cohort.out_dir)?;
    let config = RunConfig {
        cohort_root: PathBuf::from(&args.cohort.cohort_root),
        hadm_ids,
        stage1: Stage1Config {
            profile,
            schema_path,
            max_tokens: args.stage1_max_tokens,
            temperature: args.stage1_temperature,
            overwrite: args.overwrite_stage1,
        },
        stage2: Stage2Config {
            output_mode: Stage2OutputMode::Lines,
            scope,
            max_tokens: args.stage2_max_tokens,
            temperature: args.stage2_temperature,
            repetition_penalty: args.stage2_repetition_penalty,
            overwrite: args.overwrite_stage2,
            ..Stage2Config::default()
        },
        lora: LoraToggle {
            control_url: args.lora_control_url,
            adapter_id: args.lora_adapter_id,
            stage1_scale: args.lora_stage1_scale,
            stage2_scale: args.lora_stage2_scale,
        },
        continue_on_error: args.continue_on_error,
        sleep_seconds: args.sleep_seconds,
        config_dir: Some(PathBuf::from(&args.config_dir)),
    };

    // The single-backend LoRA workflow uses one client for both stages; a
    // second URL simply points the Stage-2 calls elsewhere.
    let same_backend = args.stage1_url == args.stage2_url && args.stage1_model == args.stage2_model;
    let summary = if same_backend {
        let orch = Orchestrator::new(&stage1_client, &stage1_client, &store, config)?;
        orch.run().await?
    } else {
        stage2_client.ensure_model_available().await?;
        let orch = Orchestrator::new(&stage1_client, &stage2_client, &store, config)?;
        orch.run().await?
    };

    print_success(&format!(
        "run complete: total={} ok={} skipped={} failed={}",
        summary.total, summary.ok, summary.skipped, summary.failed
    ));
    if summary.failed > 0 {
        anyhow::bail!("{} document(s) failed", summary.failed);
    }
    Ok(())
}
