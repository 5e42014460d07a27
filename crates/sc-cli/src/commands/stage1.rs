//! Stage-1 command

use crate::cli::CohortArgs;
use crate::commands::{resolve_profile, resolve_schema_path};
use crate::output::{print_error, print_success};
use anyhow::Context;
use sc_llm::ChatClient;
use sc_pipeline::stage1::{Stage1Config, Stage1Runner, Stage1Status};
use sc_pipeline::store::{ehr_path, ArtifactStore};
use serde_json::json;

#[derive(Debug, Clone, clap::Args)]
pub struct Stage1Args {
    #[command(flatten)]
    pub cohort: CohortArgs,

    /// OpenAI-compatible backend URL
    #[arg(long, env = "OPENAI_COMPAT_URL", default_value = "http://127.0.0.1:1234")]
    pub url: String,

    /// Model id on the backend
    #[arg(long, env = "OPENAI_COMPAT_MODEL_STAGE1", default_value = "medgemma-base-q5_k_m")]
    pub model: String,

    /// Stage-1 prompt/schema profile
    #[arg(long, env = "STAGE1_PROFILE", default_value = "sgr_v2")]
    pub profile: String,

    /// Stage-1 JSON schema path (profile default when unset)
    #[arg(long, default_value = crate::commands::DEFAULT_SCHEMA_PATH)]
    pub schema_path: String,

    #[arg(long, env = "STAGE1_MAX_TOKENS", default_value = "1536")]
    pub max_tokens: u32,

    #[arg(long, default_value = "0.0")]
    pub temperature: f64,

    /// Overwrite existing stage1_* outputs
    #[arg(long)]
    pub overwrite_stage1: bool,
}

pub async fn handle(args: Stage1Args) -> anyhow::Result<()> {
    let hadm_ids = args
        .cohort
        .resolve_hadm_ids()
        .map_err(|e| anyhow::anyhow!(e))?;

    let profile = resolve_profile(&args.profile)?;
    let schema_path = resolve_schema_path(&args.schema_path, profile);

    let client = ChatClient::new(&args.url, &args.model)?;
    client.ensure_model_available().await?;

    let store = ArtifactStore::new(&args.cohort.out_dir)?;
    store.record_hadm_ids(&hadm_ids)?;
    store.write_json(
        &store.meta_stage1_path(),
        &json!({
            "stage": "stage1",
            "cohort_root": &args.cohort.cohort_root,
            "url": &args.url,
            "model": &args.model,
            "stage1_profile": profile.as_str(),
            "schema_path": schema_path.display().to_string(),
            "max_tokens": args.max_tokens,
            "temperature": args.temperature,
            "ts": chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        }),
    )?;

    let config = Stage1Config {
        profile,
        schema_path,
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        overwrite: args.overwrite_stage1,
    };
    let runner = Stage1Runner::new(&client, &store, config)?;

    let cohort_root = std::path::Path::new(&args.cohort.cohort_root);
    let mut attempted = 0usize;
    let mut parse_failures = 0usize;
    for &hadm_id in &hadm_ids {
        let note_path = ehr_path(cohort_root, hadm_id);
        let note = std::fs::read_to_string(&note_path)
            .with_context(|| format!("missing note {}", note_path.display()))?;
        let outcome = runner.run_document(hadm_id, &note).await?;
        if outcome.status != Stage1Status::Skipped {
            attempted += 1;
            if !outcome.parse_ok || outcome.status == Stage1Status::Failed {
                parse_failures += 1;
            }
        }
    }

    if attempted > 0 && parse_failures == attempted {
        // Stage-1 JSON parsing failed after all retries for every document.
        print_error("stage1 JSON parsing failed for every requested document");
        std::process::exit(2);
    }

    print_success(&format!(
        "stage1 complete: {} documents ({} parse failures)",
        hadm_ids.len(),
        parse_failures
    ));
    Ok(())
}
