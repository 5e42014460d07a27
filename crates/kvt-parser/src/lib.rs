//! Recovery parser for KVT4 fact streams.
//!
//! Small local models asked for `CLUSTER|Keyword|Value|Timestamp` lines drift
//! into many shapes: fenced JSON, arrays of fact objects, grouped objects,
//! truncated JSON, narrative label blocks, and partial 3- or 5-field lines.
//! This crate recovers candidate KVT4 lines from all of them.
//!
//! The pipeline is tokenize (classify the output shape) → recover (repair
//! partial lines) → canonicalize (dedup, first-seen order). Output lines are
//! candidates: strict value grammars are applied later by the Stage-2
//! sanitizer.

mod json_forms;
mod narrative;
mod recover;

pub mod parser;

pub use parser::extract_fact_lines;
pub use recover::{recover_line, LineRecovery};
