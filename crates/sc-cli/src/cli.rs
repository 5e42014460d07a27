//! CLI definition and command dispatch

use clap::{Parser, Subcommand};

use crate::commands::{run, score, stage1, stage2};

/// StructCore - two-stage clinical extraction and readmission risk scoring
///
/// Stage 1 turns a discharge note into a structured digest on a base model;
/// Stage 2 turns the digest into KVT4 facts on a fine-tuned model; the risk
/// engine scores the merged fact stream deterministically.
#[derive(Parser)]
#[command(name = "structcore")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable trace-level logging
    #[arg(long, global = true)]
    pub trace: bool,

    /// Output format (text, json)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Arguments shared by the cohort-driven subcommands.
#[derive(Debug, Clone, clap::Args)]
pub struct CohortArgs {
    /// Cohort root: one numeric directory per admission with ehr_<id>.txt
    #[arg(long)]
    pub cohort_root: String,

    /// Run output directory
    #[arg(long)]
    pub out_dir: String,

    /// Comma-separated admission ids; empty means discover by --num-docs
    #[arg(long, default_value = "")]
    pub hadm_ids: String,

    /// Number of documents to discover when --hadm-ids is empty (0 = all)
    #[arg(long, default_value = "10")]
    pub num_docs: usize,

    /// Discover documents even when ground_truth_<id>.json is missing
    #[arg(long)]
    pub allow_missing_gt: bool,
}

impl CohortArgs {
    pub fn resolve_hadm_ids(&self) -> Result<Vec<i64>, String> {
        if !self.hadm_ids.trim().is_empty() {
            let mut ids = Vec::new();
            for token in self.hadm_ids.split(',') {
                let t = token.trim();
                if t.is_empty() {
                    continue;
                }
                ids.push(t.parse::<i64>().map_err(|_| format!("invalid hadm id: {t}"))?);
            }
            return Ok(ids);
        }
        let ids = sc_pipeline::store::discover_hadm_ids(
            std::path::Path::new(&self.cohort_root),
            self.num_docs,
            !self.allow_missing_gt,
        );
        if ids.is_empty() {
            return Err("no hadm_ids to process".to_string());
        }
        Ok(ids)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run Stage 1: note -> schema-validated domain digest
    Stage1(stage1::Stage1Args),

    /// Run Stage 2: Stage-1 Markdown -> sanitized KVT4 facts
    Stage2(stage2::Stage2Args),

    /// Score existing KVT4 fact streams with the risk engine
    #[command(subcommand)]
    Score(ScoreCommands),

    /// Sequential per-document run: Stage 1 -> Stage 2 -> risk scoring
    Run(run::RunArgs),
}

#[derive(Subcommand)]
pub enum ScoreCommands {
    /// Score a single KVT4 text file
    File {
        /// Path to the KVT4 file
        path: String,

        /// Directory with the scoring-rule bundles
        #[arg(long, default_value = "config")]
        config_dir: String,
    },

    /// Score KVT4 text read from stdin
    Inline {
        #[arg(long, default_value = "config")]
        config_dir: String,
    },

    /// Score every row of a JSONL corpus (hadm_id + completion)
    Jsonl {
        /// Path to the JSONL file
        path: String,

        #[arg(long, default_value = "config")]
        config_dir: String,

        /// Limit the number of rows (0 = all)
        #[arg(long, default_value = "0")]
        limit: usize,

        /// Print summary statistics only
        #[arg(long)]
        summary: bool,
    },
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Commands::Stage1(args) => stage1::handle(args).await,
            Commands::Stage2(args) => stage2::handle(args).await,
            Commands::Score(cmd) => Ok(score::handle(cmd, self.format)?),
            Commands::Run(args) => run::handle(args).await,
        }
    }
}
