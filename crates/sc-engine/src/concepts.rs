//! Mapping open-vocabulary clinical terms onto concept groups.

use crate::rules::ConceptGroup;
use std::collections::HashMap;

/// Synonym-indexed concept groups with tiered matching.
#[derive(Debug, Clone)]
pub struct ConceptIndex {
    groups: Vec<ConceptGroup>,
    /// lowercase synonym → group index (first definition wins).
    synonym_index: HashMap<String, usize>,
}

impl ConceptIndex {
    pub fn new(groups: Vec<ConceptGroup>) -> Self {
        let mut synonym_index = HashMap::new();
        for (i, g) in groups.iter().enumerate() {
            for syn in &g.synonyms {
                let key = syn.trim().to_lowercase();
                synonym_index.entry(key).or_insert(i);
            }
        }
        Self {
            groups,
            synonym_index,
        }
    }

    pub fn group_by_id(&self, id: &str) -> Option<&ConceptGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Tiered matching: exact synonym > word-boundary substring > raw
    /// substring of at least 4 chars. The boundary tier stops short synonyms
    /// like `tia` from matching inside `essential`; longer synonyms win ties.
    pub fn match_group(&self, keyword: &str) -> Option<&ConceptGroup> {
        let kw = keyword.trim().to_lowercase();
        if kw.is_empty() {
            return None;
        }

        if let Some(&i) = self.synonym_index.get(kw.as_str()) {
            return Some(&self.groups[i]);
        }

        let kw_words: Vec<&str> = kw
            .split(|c: char| c.is_whitespace() || ",;/-()".contains(c))
            .filter(|w| !w.is_empty())
            .collect();

        let mut best_wb: Option<(usize, usize)> = None; // (group, syn_len)
        let mut best_sub: Option<(usize, usize)> = None;

        for (syn, &i) in &self.synonym_index {
            if !kw.contains(syn.as_str()) {
                continue;
            }
            let is_word_match = kw_words.contains(&syn.as_str())
                || kw.starts_with(&format!("{syn} "))
                || kw.ends_with(&format!(" {syn}"))
                || kw.contains(&format!(" {syn} "));

            if is_word_match {
                if best_wb.map_or(true, |(_, l)| syn.len() > l) {
                    best_wb = Some((i, syn.len()));
                }
            } else if syn.len() >= 4 && best_sub.map_or(true, |(_, l)| syn.len() > l) {
                best_sub = Some((i, syn.len()));
            }
        }

        best_wb
            .or(best_sub)
            .map(|(i, _)| &self.groups[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> ConceptIndex {
        ConceptIndex::new(vec![
            ConceptGroup {
                id: "heart_failure".into(),
                name: "Heart Failure".into(),
                risk_weight: 8.0,
                synonyms: vec!["heart failure".into(), "chf".into(), "cardiomyopathy".into()],
            },
            ConceptGroup {
                id: "stroke".into(),
                name: "Cerebrovascular Disease".into(),
                risk_weight: 6.0,
                synonyms: vec!["stroke".into(), "tia".into(), "cva".into()],
            },
            ConceptGroup {
                id: "hypertension".into(),
                name: "Hypertension".into(),
                risk_weight: 2.0,
                synonyms: vec!["hypertension".into(), "htn".into()],
            },
        ])
    }

    #[test]
    fn test_exact_match() {
        let idx = index();
        assert_eq!(idx.match_group("CHF").unwrap().id, "heart_failure");
    }

    #[test]
    fn test_word_boundary_match() {
        let idx = index();
        assert_eq!(
            idx.match_group("acute on chronic heart failure").unwrap().id,
            "heart_failure"
        );
        assert_eq!(idx.match_group("history of TIA").unwrap().id, "stroke");
    }

    #[test]
    fn test_short_synonym_does_not_substring_match() {
        let idx = index();
        // "tia" is inside "essential" but short synonyms need a word boundary.
        assert!(idx.match_group("essential tremor").is_none());
    }

    #[test]
    fn test_substring_match_needs_four_chars() {
        let idx = index();
        // "stroke" (6 chars) may match inside "strokes" without a boundary.
        assert_eq!(idx.match_group("strokes").unwrap().id, "stroke");
        // "cva" (3 chars) may not.
        assert!(idx.match_group("cvad line").is_none());
    }

    #[test]
    fn test_longer_synonym_preferred() {
        let idx = index();
        let g = idx.match_group("chf with heart failure exacerbation").unwrap();
        assert_eq!(g.id, "heart_failure");
    }
}
