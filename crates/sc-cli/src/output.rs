//! Output formatting utilities

use crate::cli::OutputFormat;
use colored::Colorize;
use sc_engine::RiskResult;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a serializable value as JSON or a custom text format
pub fn print_output<T: Serialize>(value: &T, format: OutputFormat, text_fn: impl FnOnce(&T)) {
    match format {
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(value) {
                println!("{json}");
            }
        }
        OutputFormat::Text => text_fn(value),
    }
}

fn colorize_category(result: &RiskResult) -> String {
    let label = result.risk_category.as_str();
    match result.risk_color.as_str() {
        "green" => label.green().bold().to_string(),
        "yellow" => label.yellow().bold().to_string(),
        "orange" | "red" => label.red().bold().to_string(),
        _ => label.bold().to_string(),
    }
}

/// Print one risk result in the requested format.
pub fn print_risk_result(result: &RiskResult, hadm_id: Option<&str>, format: OutputFormat) {
    print_output(result, format, |r| {
        println!("{}", sc_engine::format_report(r, hadm_id));
        println!();
        println!("Overall: {}", colorize_category(r));
    });
}

/// One row of the JSONL scoring summary table.
#[derive(Tabled, Serialize)]
pub struct ScoreSummaryRow {
    #[tabled(rename = "Category")]
    pub category: String,
    #[tabled(rename = "Count")]
    pub count: usize,
    #[tabled(rename = "Share")]
    pub share: String,
}

/// Print corpus-level summary statistics for a batch of risk results.
pub fn print_jsonl_summary(results: &[(String, RiskResult)], format: OutputFormat) {
    let n = results.len().max(1);
    let scores: Vec<i64> = results.iter().map(|(_, r)| r.composite_score).collect();
    let probs: Vec<f64> = results.iter().map(|(_, r)| r.probability).collect();
    let days: Vec<f64> = results.iter().map(|(_, r)| r.estimated_days).collect();

    let mut sorted = scores.clone();
    sorted.sort_unstable();
    let median = sorted.get(sorted.len() / 2).copied().unwrap_or(0);

    let mut rows: Vec<ScoreSummaryRow> = Vec::new();
    for cat in ["Low", "Medium", "High", "Critical"] {
        let count = results.iter().filter(|(_, r)| r.risk_category == cat).count();
        rows.push(ScoreSummaryRow {
            category: cat.to_string(),
            count,
            share: format!("{:.0}%", count as f64 / n as f64 * 100.0),
        });
    }

    let payload = serde_json::json!({
        "patients": results.len(),
        "score": {
            "mean": scores.iter().sum::<i64>() as f64 / n as f64,
            "min": sorted.first().copied().unwrap_or(0),
            "max": sorted.last().copied().unwrap_or(0),
            "median": median,
        },
        "probability_mean": probs.iter().sum::<f64>() / n as f64,
        "days_estimate": {
            "mean": days.iter().sum::<f64>() / n as f64,
            "min": days.iter().cloned().fold(f64::INFINITY, f64::min),
            "max": days.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        },
        "categories": rows,
    });

    print_output(&payload, format, |_| {
        println!("=== Summary ({} patients) ===", results.len());
        println!(
            "Score: mean={:.1}, min={}, max={}, median={}",
            scores.iter().sum::<i64>() as f64 / n as f64,
            sorted.first().copied().unwrap_or(0),
            sorted.last().copied().unwrap_or(0),
            median
        );
        println!(
            "P(readmit): mean={:.1}%",
            probs.iter().sum::<f64>() / n as f64 * 100.0
        );
        println!("{}", Table::new(&rows));
        println!(
            "Days estimate: mean={:.1}, min={:.1}, max={:.1}",
            days.iter().sum::<f64>() / n as f64,
            days.iter().cloned().fold(f64::INFINITY, f64::min),
            days.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        );
    });
}
