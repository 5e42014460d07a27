//! Command handlers

pub mod run;
pub mod score;
pub mod stage1;
pub mod stage2;

use sc_llm::prompts::Stage1Profile;
use std::path::PathBuf;

pub(crate) const DEFAULT_SCHEMA_PATH: &str = "schemas/readmission_domain_summary.schema.json";

/// Apply the production guardrail and resolve the effective profile:
/// `sgr_v4` is disabled unless explicitly allowed.
pub(crate) fn resolve_profile(requested: &str) -> anyhow::Result<Stage1Profile> {
    let profile: Stage1Profile = requested
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    if profile == Stage1Profile::SgrV4
        && !sc_pipeline::env::env_truthy("MEDGEMMA_ALLOW_SGR_V4_STAGE1", false)
    {
        tracing::warn!("Stage1 profile sgr_v4 is disabled for production; forcing sgr_v2");
        return Ok(Stage1Profile::SgrV2);
    }
    Ok(profile)
}

/// Resolve the schema path: when the generic default is passed, the profile
/// selects its own schema file next to it.
pub(crate) fn resolve_schema_path(schema_path: &str, profile: Stage1Profile) -> PathBuf {
    if schema_path.trim() == DEFAULT_SCHEMA_PATH {
        return PathBuf::from("schemas").join(profile.schema_filename());
    }
    let path = PathBuf::from(schema_path.trim());
    // The sgr_v4 schema is gated with its profile.
    if profile != Stage1Profile::SgrV4
        && schema_path.ends_with("readmission_domain_summary_sgr_v4.schema.json")
        && !sc_pipeline::env::env_truthy("MEDGEMMA_ALLOW_SGR_V4_STAGE1", false)
    {
        tracing::warn!("Stage1 schema sgr_v4 is disabled for production; forcing sgr_v2 schema");
        return PathBuf::from("schemas").join(Stage1Profile::SgrV2.schema_filename());
    }
    path
}
