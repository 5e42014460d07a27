//! Recovery of facts from narrative and heading-context output.

use once_cell::sync::Lazy;
use regex::Regex;
use sc_core::Cluster;

/// `**Cluster:** VITALS` style labeled lines.
static LABELED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*\*{0,2}(?P<label>cluster|keyword|value|timestamp)\*{0,2}\s*[:=]\s*\*{0,2}(?P<val>.+?)\*{0,2}\s*$")
        .expect("labeled line regex")
});

/// `**VITALS:**` section headings that set cluster context.
static HEADING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:#{1,4}\s*)?\*{0,2}(?P<name>[A-Z][A-Z ]{3,})\*{0,2}\s*:?\s*\*{0,2}\s*$")
        .expect("heading regex")
});

/// Inline `{"K": "...", "V": "...", "T": "..."}` items under a heading.
static INLINE_KVT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\{\s*"(?:K|keyword)"\s*:\s*"(?P<k>[^"]+)"\s*,\s*"(?:V|value)"\s*:\s*(?P<v>"[^"]*"|-?\d+(?:\.\d+)?)\s*(?:,\s*"(?:T|timestamp)"\s*:\s*"(?P<t>[^"]+)"\s*)?\}"#,
    )
    .expect("inline kvt regex")
});

/// Assemble facts from `**Cluster:** … **Keyword:** …` narrative blocks.
/// A block completes when all four labels have been seen; cluster context
/// carries over so several keyword/value/timestamp triples can share it.
pub fn facts_from_narrative(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cluster: Option<Cluster> = None;
    let mut keyword: Option<String> = None;
    let mut value: Option<String> = None;
    let mut timestamp: Option<String> = None;

    let mut flush = |cluster: &Option<Cluster>,
                     keyword: &mut Option<String>,
                     value: &mut Option<String>,
                     timestamp: &mut Option<String>,
                     out: &mut Vec<String>| {
        if let (Some(c), Some(k), Some(v)) = (cluster, keyword.take(), value.take()) {
            let t = timestamp.take().unwrap_or_else(|| "Unknown".to_string());
            if !k.is_empty() && !v.is_empty() {
                out.push(format!("{}|{}|{}|{}", c.name(), k, v, t));
            }
        } else {
            keyword.take();
            value.take();
            timestamp.take();
        }
    };

    for ln in text.lines() {
        let Some(caps) = LABELED_RE.captures(ln) else {
            continue;
        };
        let label = caps["label"].to_lowercase();
        let val = caps["val"].trim().to_string();
        match label.as_str() {
            "cluster" => {
                flush(&cluster, &mut keyword, &mut value, &mut timestamp, &mut out);
                cluster = Cluster::parse_loose(&val);
            }
            "keyword" => {
                if keyword.is_some() {
                    flush(&cluster, &mut keyword, &mut value, &mut timestamp, &mut out);
                }
                keyword = Some(val);
            }
            "value" => value = Some(val),
            "timestamp" => {
                timestamp = Some(val);
                flush(&cluster, &mut keyword, &mut value, &mut timestamp, &mut out);
            }
            _ => {}
        }
    }
    flush(&cluster, &mut keyword, &mut value, &mut timestamp, &mut out);
    out
}

/// Assemble facts from cluster headings followed by inline `{"K": …}` items.
pub fn facts_from_heading_context(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cluster: Option<Cluster> = None;

    for ln in text.lines() {
        if let Some(caps) = HEADING_RE.captures(ln) {
            if let Some(c) = Cluster::parse_loose(caps["name"].trim()) {
                cluster = Some(c);
                continue;
            }
        }
        let Some(c) = cluster else { continue };
        for caps in INLINE_KVT_RE.captures_iter(ln) {
            let k = caps["k"].trim();
            let v_tok = caps["v"].trim();
            let v = v_tok.trim_matches('"').trim();
            let t = caps
                .name("t")
                .map(|m| m.as_str().trim())
                .unwrap_or(c.canonical_timestamp().as_str());
            if !k.is_empty() && !v.is_empty() {
                out.push(format!("{}|{}|{}|{}", c.name(), k, v, t));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrative_block() {
        let text = "\
**Cluster:** VITALS
**Keyword:** Heart Rate
**Value:** 88
**Timestamp:** Admission
**Keyword:** SpO2
**Value:** 98
**Timestamp:** Admission";
        let lines = facts_from_narrative(text);
        assert_eq!(
            lines,
            vec!["VITALS|Heart Rate|88|Admission", "VITALS|SpO2|98|Admission"]
        );
    }

    #[test]
    fn test_narrative_missing_timestamp_defaults_unknown() {
        let text = "Cluster: LABS\nKeyword: WBC\nValue: 7.7\nCluster: LABS";
        assert_eq!(facts_from_narrative(text), vec!["LABS|WBC|7.7|Unknown"]);
    }

    #[test]
    fn test_heading_context() {
        let text = "\
**VITALS:**
{\"K\": \"Heart Rate\", \"V\": \"88\", \"T\": \"Admission\"} {\"K\": \"SpO2\", \"V\": 98}
**DISPOSITION:**
{\"K\": \"Discharge Disposition\", \"V\": \"Home\"}";
        let lines = facts_from_heading_context(text);
        assert_eq!(
            lines,
            vec![
                "VITALS|Heart Rate|88|Admission",
                "VITALS|SpO2|98|Admission",
                "DISPOSITION|Discharge Disposition|Home|Discharge",
            ]
        );
    }
}
