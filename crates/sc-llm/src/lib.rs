//! # StructCore LM access
//!
//! Minimal OpenAI-compatible chat client plus the versioned prompt library.
//!
//! Intended for local inference backends (LM Studio, llama.cpp server, vLLM,
//! etc.). The client covers `/v1/chat/completions` with a graceful
//! `response_format` fallback cascade, `/v1/models` availability polling, the
//! raw `/completion` endpoint, and best-effort LoRA adapter control.
//!
//! ## Key Types
//!
//! - [`ChatClient`] - one backend URL + model id, one HTTP call at a time
//! - [`LmBackend`] - trait boundary so extractors are testable with [`MockBackend`]
//! - [`prompts`] - byte-stable templates with SHA-256 prefix fingerprints

pub mod backend;
pub mod client;
pub mod prompts;

pub use backend::{LmBackend, MockBackend};
pub use client::{
    normalize_urls, AdapterScale, ChatClient, ChatOptions, ChatOutcome, ClientError, ClientResult,
    LoraControl, ResponseFormatMeta,
};
pub use prompts::{
    PromptTemplate, Stage1Profile, Stage2OutputMode, Stage2Scope, Stage2Template,
};
