//! Deterministic trimming of long notes.
//!
//! Long notes blow past small context windows and cause backend 400s. Each
//! strategy is deterministic so retries and reruns see identical prompts.

use crate::env::{env_string, env_usize};
use once_cell::sync::Lazy;
use regex::Regex;
use sc_core::{LABS_ORDER, VITALS_ORDER};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimStrategy {
    /// No trimming: send the note as-is.
    Full,
    /// Keep the middle slice.
    Middle,
    /// Keep head and tail halves.
    HeadTail,
    /// Keep a head prefix plus windows around objective anchor terms.
    KeywordWindow,
    /// Like [`TrimStrategy::KeywordWindow`] but spends the whole remaining
    /// budget on objective windows so vitals/labs land near the prompt end.
    /// Sliding-window-attention models attend mostly to recent tokens.
    KeywordWindowObjectiveLast,
}

impl TrimStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrimStrategy::Full => "full",
            TrimStrategy::Middle => "middle",
            TrimStrategy::HeadTail => "head_tail",
            TrimStrategy::KeywordWindow => "keyword_window",
            TrimStrategy::KeywordWindowObjectiveLast => "keyword_window_objective_last",
        }
    }
}

impl FromStr for TrimStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(TrimStrategy::Full),
            "middle" | "center" => Ok(TrimStrategy::Middle),
            "head_tail" | "head+tail" => Ok(TrimStrategy::HeadTail),
            "keyword_window" | "kw" | "window" => Ok(TrimStrategy::KeywordWindow),
            "keyword_window_objective_last" | "keyword_window_obj_last" | "keyword_window_strict" => {
                Ok(TrimStrategy::KeywordWindowObjectiveLast)
            }
            other => Err(format!("unknown trim strategy: {other}")),
        }
    }
}

const EXTRA_OBJECTIVE_TERMS: [&str; 19] = [
    "vitals:",
    "vital signs",
    "labs:",
    "pertinent labs",
    "bp",
    "heart rate",
    "respiratory rate",
    "spo2",
    "wbc",
    "hgb",
    "hct",
    "plt",
    "bun",
    "urea n",
    "creat",
    "total co2",
    "hco3",
    "glucose",
    "bicarb",
];

static SIMPLE_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+$").expect("token regex"));

fn floor_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn objective_term_set() -> Vec<String> {
    VITALS_ORDER
        .iter()
        .chain(LABS_ORDER.iter())
        .map(|t| t.to_lowercase())
        .chain(EXTRA_OBJECTIVE_TERMS.iter().map(|t| t.to_string()))
        .collect()
}

fn anchor_terms() -> Vec<String> {
    if let Some(raw) = env_string("MEDGEMMA_KEYWORD_WINDOW_TERMS") {
        let terms: Vec<String> = raw
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if !terms.is_empty() {
            return terms;
        }
    }
    objective_term_set()
}

/// Short alphanumeric anchors (`k`, `na`, `bp`) need word boundaries to
/// avoid matching the whole document.
fn term_to_regex(term: &str) -> Option<Regex> {
    let pattern = if SIMPLE_TOKEN_RE.is_match(term) {
        format!(r"\b{}\b", regex::escape(term))
    } else {
        regex::escape(term)
    };
    Regex::new(&pattern).ok()
}

fn merge_spans(mut spans: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    if spans.is_empty() {
        return spans;
    }
    spans.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Windows around anchor terms, split into objective-term spans and spans
/// from custom (non-objective) terms.
fn find_anchor_spans(text: &str, window: usize) -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
    let lower = text.to_lowercase();
    let terms = anchor_terms();
    let objective_set = objective_term_set();
    let mut obj_spans = Vec::new();
    let mut other_spans = Vec::new();
    for term in &terms {
        let Some(re) = term_to_regex(term) else { continue };
        for m in re.find_iter(&lower) {
            let start = floor_boundary(text, m.start().saturating_sub(window));
            let end = ceil_boundary(text, (m.end() + window).min(text.len()));
            if objective_set.contains(term) {
                obj_spans.push((start, end));
            } else {
                other_spans.push((start, end));
            }
        }
    }
    (obj_spans, other_spans)
}

fn collect_spans(text: &str, merged: &[(usize, usize)], budget: usize) -> String {
    let mut out = String::new();
    let mut remain = budget;
    for &(start, end) in merged {
        if remain == 0 {
            break;
        }
        let chunk = &text[start..end];
        if chunk.len() <= remain {
            out.push_str("\n\n");
            out.push_str(chunk);
            remain -= chunk.len();
        } else {
            let cut = floor_boundary(chunk, remain);
            out.push_str("\n\n");
            out.push_str(&chunk[..cut]);
            remain = 0;
        }
    }
    out
}

/// Trim `text` to at most `max_chars` bytes using the given strategy.
pub fn trim_text(text: &str, max_chars: usize, strategy: TrimStrategy) -> String {
    if max_chars == 0 || text.len() <= max_chars {
        return text.to_string();
    }

    match strategy {
        TrimStrategy::Full => text.to_string(),
        TrimStrategy::Middle => {
            let start = floor_boundary(text, (text.len() - max_chars) / 2);
            let end = ceil_boundary(text, (start + max_chars).min(text.len()));
            text[start..end].to_string()
        }
        TrimStrategy::HeadTail => {
            let head_chars = env_usize("MEDGEMMA_TRIM_HEAD_CHARS", max_chars / 2);
            let tail_chars = env_usize(
                "MEDGEMMA_TRIM_TAIL_CHARS",
                max_chars.saturating_sub(head_chars),
            );
            let head_end = floor_boundary(text, head_chars);
            let tail_start = ceil_boundary(text, text.len().saturating_sub(tail_chars));
            format!("{}\n\n{}", &text[..head_end], &text[tail_start..])
        }
        TrimStrategy::KeywordWindow | TrimStrategy::KeywordWindowObjectiveLast => {
            let window = env_usize("MEDGEMMA_KEYWORD_WINDOW_CHARS", 900);
            let head_keep = env_usize("MEDGEMMA_KEYWORD_WINDOW_HEAD_CHARS", 900);

            let (obj_spans, other_spans) = find_anchor_spans(text, window);
            if obj_spans.is_empty() && other_spans.is_empty() {
                // No anchors found; fall back to the middle slice.
                return trim_text(text, max_chars, TrimStrategy::Middle);
            }
            let obj_merged = merge_spans(obj_spans);
            let other_merged = merge_spans(other_spans);

            let head_end = floor_boundary(text, head_keep.min(max_chars));
            let head = &text[..head_end];
            let budget = max_chars.saturating_sub(head.len());
            if budget == 0 {
                return head.to_string();
            }

            // The objective-last variant keeps head as the only global
            // context and puts every remaining byte into objective windows
            // at the end of the prompt.
            let (other_txt, obj_budget) = match strategy {
                TrimStrategy::KeywordWindowObjectiveLast => (String::new(), budget),
                _ => {
                    let obj_txt_len: usize = obj_merged.iter().map(|(s, e)| e - s).sum();
                    let other_budget = budget.saturating_sub(obj_txt_len.min(budget));
                    (collect_spans(text, &other_merged, other_budget), budget)
                }
            };
            let obj_txt = collect_spans(text, &obj_merged, obj_budget.saturating_sub(other_txt.len()));
            format!("{head}{other_txt}{obj_txt}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_untouched() {
        assert_eq!(trim_text("short", 100, TrimStrategy::Middle), "short");
    }

    #[test]
    fn test_middle_slice_length() {
        let text = "a".repeat(10_000);
        let out = trim_text(&text, 1000, TrimStrategy::Middle);
        assert_eq!(out.len(), 1000);
    }

    #[test]
    fn test_head_tail_keeps_both_ends() {
        let text = format!("HEAD{}TAIL", "x".repeat(10_000));
        let out = trim_text(&text, 1000, TrimStrategy::HeadTail);
        assert!(out.starts_with("HEAD"));
        assert!(out.ends_with("TAIL"));
        assert!(out.len() <= 1010);
    }

    #[test]
    fn test_keyword_window_keeps_vitals_region() {
        let filler = "lorem ipsum dolor sit amet ".repeat(400);
        let text = format!("{filler}\nVitals: HR 88 BP 120/80 SpO2 98% RA\n{filler}");
        let out = trim_text(&text, 3000, TrimStrategy::KeywordWindow);
        assert!(out.contains("HR 88"));
        assert!(out.len() <= 3100);
    }

    #[test]
    fn test_keyword_window_falls_back_to_middle() {
        let text = "z".repeat(10_000);
        let out = trim_text(&text, 500, TrimStrategy::KeywordWindow);
        assert_eq!(out.len(), 500);
    }

    #[test]
    fn test_strategy_parse_aliases() {
        assert_eq!("center".parse::<TrimStrategy>().unwrap(), TrimStrategy::Middle);
        assert_eq!(
            "keyword_window_obj_last".parse::<TrimStrategy>().unwrap(),
            TrimStrategy::KeywordWindowObjectiveLast
        );
        assert!("bogus".parse::<TrimStrategy>().is_err());
    }
}
