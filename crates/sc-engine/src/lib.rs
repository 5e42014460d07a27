//! # StructCore risk engine
//!
//! Fully deterministic rule scoring over a normalized KVT4 fact stream:
//! nine per-cluster scorers, cross-cluster interaction patterns, logistic
//! probability calibration, days-to-readmission estimation with a scaled
//! survival curve, and an explainability payload.
//!
//! Rule bundles are external JSON (`scoring_rules.json`,
//! `snomed_problem_groups.json`, `symptom_urgency_groups.json`), loaded once
//! per process into a [`RiskEngine`] value that is passed by reference —
//! no process-wide singletons.

pub mod concepts;
pub mod engine;
pub mod interactions;
pub mod parse;
pub mod predict;
pub mod report;
pub mod rules;
pub mod scorers;

pub use engine::RiskEngine;
pub use parse::{FactSet, FactValue, ParsedFact};
pub use report::{format_report, ClusterScore, InteractionResult, RiskResult, SurvivalCurve};
pub use rules::{EngineError, EngineResult, RuleBundle};
