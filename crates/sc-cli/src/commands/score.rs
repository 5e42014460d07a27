//! Risk-engine scoring over existing KVT4 streams

use crate::cli::{OutputFormat, ScoreCommands};
use crate::error::CliResult;
use crate::output::{print_jsonl_summary, print_risk_result};
use sc_engine::RiskEngine;
use std::io::Read;
use std::path::Path;

pub fn handle(cmd: ScoreCommands, format: OutputFormat) -> CliResult<()> {
    match cmd {
        ScoreCommands::File { path, config_dir } => {
            let engine = RiskEngine::from_config_dir(Path::new(&config_dir))?;
            let result = engine.score_file(Path::new(&path))?;
            print_risk_result(&result, None, format);
            Ok(())
        }
        ScoreCommands::Inline { config_dir } => {
            let engine = RiskEngine::from_config_dir(Path::new(&config_dir))?;
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            let result = engine.score_text(&text);
            print_risk_result(&result, None, format);
            Ok(())
        }
        ScoreCommands::Jsonl {
            path,
            config_dir,
            limit,
            summary,
        } => {
            let engine = RiskEngine::from_config_dir(Path::new(&config_dir))?;
            let results = engine.score_jsonl(Path::new(&path), limit)?;
            if summary {
                print_jsonl_summary(&results, format);
            } else {
                for (hadm_id, result) in &results {
                    print_risk_result(result, Some(hadm_id), format);
                    println!("\n{}\n", "=".repeat(60));
                }
            }
            Ok(())
        }
    }
}
