//! Removal of backend-internal special tokens from completions.

use once_cell::sync::Lazy;
use regex::Regex;

static INTERNAL_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:bos|eos|pad|unk|start_of_turn|end_of_turn|unused\d+)>")
        .expect("internal token regex")
});

/// Strip chat-template and reserved tokens that some GGUF backends leak
/// into the completion text.
pub fn strip_internal_tokens(text: &str) -> String {
    INTERNAL_TOKEN_RE.replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_template_tokens() {
        let raw = "<start_of_turn>{\"a\": 1}<end_of_turn><unused94>";
        assert_eq!(strip_internal_tokens(raw), "{\"a\": 1}");
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(strip_internal_tokens("VITALS|HR|88|Admission"), "VITALS|HR|88|Admission");
    }
}
