//! # StructCore core types
//!
//! Shared data model for the two-stage clinical extraction pipeline:
//! the closed cluster set, canonical keyword tables, the four-field
//! fact record (KVT4), and the Stage-1 domain digest.
//!
//! ## Key Types
//!
//! - [`Cluster`] - one of nine closed clinical categories
//! - [`Timestamp`] - closed temporal tag (`ADM`/`DC` aliases accepted)
//! - [`Fact`] - a `CLUSTER|Keyword|Value|Timestamp` record
//! - [`Digest`] - the nine-key Stage-1 summary with per-cluster value shapes

pub mod cluster;
pub mod digest;
pub mod error;
pub mod fact;
pub mod keyword;
pub mod timestamp;

pub use cluster::Cluster;
pub use digest::{ClusterValue, Digest, ObjectiveBlock, ProblemsBlock, SymptomsBlock};
pub use error::{CoreError, CoreResult};
pub use fact::{parse_fact_lines, render_fact_lines, Fact};
pub use keyword::{
    canonical_keywords, cluster_for_keyword, normalize_lab_key, normalize_sparse_key,
    DEMOGRAPHICS_KEYS, DISPOSITION_KEYS, LABS_ORDER, MEDICATIONS_KEYS, PROCEDURES_KEYS,
    UTILIZATION_KEYS, VITALS_ORDER,
};
pub use timestamp::Timestamp;

/// Placeholder written wherever the model had no evidence.
pub const NOT_STATED: &str = "not stated";

/// Tokens treated as "no information" when cleaning free-text values.
pub const TEXT_PLACEHOLDERS: &[&str] = &[
    "", "not stated", "none", "none.", "unknown", "n/a", "na", "null", "...", "___",
];

/// Check a free-text value against the placeholder set (case-insensitive).
pub fn is_placeholder(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    TEXT_PLACEHOLDERS.iter().any(|p| *p == v)
}
