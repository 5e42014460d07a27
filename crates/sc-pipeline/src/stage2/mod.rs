//! Stage 2: Stage-1 Markdown → sanitized KVT4 fact stream.

pub mod extract;
pub mod sanitize;

pub use extract::{Stage2Config, Stage2DocOutcome, Stage2Runner};
pub use sanitize::sanitize_stage2;
