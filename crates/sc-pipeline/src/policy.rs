//! Stage-2 sanitizer policy profiles.
//!
//! The sanitizer's feature flags form two coherent bundles: **validated**
//! (conservative defaults matching the calibrated baseline) and
//! **experimental** (aggressive recovery). The run-level profile comes from
//! `MEDGEMMA_STAGE2_PROFILE`; individual `MEDGEMMA_*` variables override
//! single fields.

use crate::env::{env_truthy, env_truthy_stage2};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Stage2Policy {
    pub profile: String,
    /// Use the prompt shaped like the fine-tuning data for scope `all`.
    pub training_match_prompt: bool,
    /// Repair 3-field lines (missing cluster or timestamp).
    pub recover_3part_lines: bool,
    /// Move canonical non-numeric keywords out of wrong semantic clusters.
    pub reclassify_nonnumeric_clusters: bool,
    /// Expand aggregate PROBLEMS/SYMPTOMS lines into per-item facts.
    pub expand_semantic_lines: bool,
    /// Canonicalize objective timestamps even under scope `all`.
    pub objective_ts_canonical_all: bool,
    /// Collapse consecutive identical raw lines (repetition loops).
    pub consecutive_dedup: bool,
    /// Inject conservative PROCEDURES facts from Stage-1 evidence.
    pub stage1_procedure_fallback: bool,
    /// Drop binary `no` / zero-count facts that only inflate false positives.
    pub drop_low_info_negatives: bool,
    /// Fragment filter + semantic dedup for PROBLEMS/SYMPTOMS.
    pub semantic_gate: bool,
    /// Drop UTILIZATION facts without Stage-1 evidence.
    pub utilization_evidence_gate: bool,
    /// Drop prompt/instruction leakage lines.
    pub drop_prompt_leakage: bool,
    /// Normalize 0/1/true/false flags to yes/no.
    pub normalize_binary_flags: bool,
    /// Retry Stage-2 when raw KVT4 validity is low.
    pub retry_on_low_valid_rate: bool,
}

impl Stage2Policy {
    /// Conservative baseline: only the always-on hygiene steps.
    pub fn validated() -> Self {
        Self {
            profile: "v41_validated".to_string(),
            training_match_prompt: false,
            recover_3part_lines: false,
            reclassify_nonnumeric_clusters: false,
            expand_semantic_lines: false,
            objective_ts_canonical_all: false,
            consecutive_dedup: false,
            stage1_procedure_fallback: false,
            drop_low_info_negatives: false,
            semantic_gate: false,
            utilization_evidence_gate: false,
            drop_prompt_leakage: true,
            normalize_binary_flags: true,
            retry_on_low_valid_rate: false,
        }
    }

    /// Aggressive recovery bundle.
    pub fn experimental() -> Self {
        Self {
            profile: "experimental".to_string(),
            training_match_prompt: true,
            recover_3part_lines: true,
            reclassify_nonnumeric_clusters: true,
            expand_semantic_lines: true,
            objective_ts_canonical_all: true,
            consecutive_dedup: true,
            stage1_procedure_fallback: true,
            drop_low_info_negatives: true,
            semantic_gate: true,
            utilization_evidence_gate: true,
            drop_prompt_leakage: true,
            normalize_binary_flags: true,
            retry_on_low_valid_rate: false,
        }
    }

    /// Resolve the run policy: profile selection via
    /// `MEDGEMMA_STAGE2_PROFILE`, then per-field environment overrides.
    pub fn from_env() -> Self {
        Self {
            profile: crate::env::stage2_profile_name(),
            training_match_prompt: env_truthy_stage2(
                "MEDGEMMA_STAGE2_TRAINING_MATCH_PROMPT",
                false,
                true,
            ),
            recover_3part_lines: env_truthy_stage2(
                "MEDGEMMA_STAGE2_RECOVER_3PART_LINES",
                false,
                true,
            ),
            reclassify_nonnumeric_clusters: env_truthy_stage2(
                "MEDGEMMA_STAGE2_RECLASSIFY_NONNUMERIC_CLUSTERS",
                false,
                true,
            ),
            expand_semantic_lines: env_truthy_stage2("MEDGEMMA_EXPAND_SEMANTIC_LINES", false, true),
            objective_ts_canonical_all: env_truthy_stage2(
                "MEDGEMMA_OBJECTIVE_TS_CANONICAL_ALL",
                false,
                true,
            ),
            consecutive_dedup: env_truthy_stage2("MEDGEMMA_STAGE2_CONSECUTIVE_DEDUP", false, true),
            stage1_procedure_fallback: env_truthy_stage2(
                "MEDGEMMA_STAGE1_PROCEDURE_FALLBACK",
                false,
                true,
            ),
            drop_low_info_negatives: env_truthy_stage2(
                "MEDGEMMA_DROP_LOW_INFO_NEGATIVES",
                false,
                true,
            ),
            semantic_gate: env_truthy_stage2("MEDGEMMA_STAGE2_SEMANTIC_GATE", false, true),
            utilization_evidence_gate: env_truthy_stage2(
                "MEDGEMMA_UTILIZATION_EVIDENCE_GATE",
                false,
                true,
            ),
            drop_prompt_leakage: env_truthy("MEDGEMMA_STAGE2_DROP_PROMPT_LEAKAGE", true),
            normalize_binary_flags: env_truthy("MEDGEMMA_POSTPROCESS_BINARY_FLAGS", true),
            retry_on_low_valid_rate: env_truthy("MEDGEMMA_STAGE2_RETRY_ON_LOW_VALID_RATE", false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_is_conservative() {
        let p = Stage2Policy::validated();
        assert!(!p.recover_3part_lines);
        assert!(!p.expand_semantic_lines);
        assert!(!p.semantic_gate);
        assert!(p.drop_prompt_leakage);
        assert!(p.normalize_binary_flags);
    }

    #[test]
    fn test_experimental_enables_recovery() {
        let p = Stage2Policy::experimental();
        assert!(p.recover_3part_lines);
        assert!(p.reclassify_nonnumeric_clusters);
        assert!(p.expand_semantic_lines);
        assert!(p.utilization_evidence_gate);
    }
}
