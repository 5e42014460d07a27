//! Stage 1: note → schema-validated domain digest.

pub mod evidence;
pub mod extract;
pub mod facts;
pub mod normalize;

pub use extract::{Stage1Config, Stage1Outcome, Stage1Runner, Stage1Status};
pub use facts::objective_facts;
pub use normalize::normalize_digest;
