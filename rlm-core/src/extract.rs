//! Answer and code extraction from model text.
//!
//! A response finalizes with `FINAL("…")` (single quotes and backticks
//! also accepted; backticks may span lines) or continues with the first
//! fenced code block. The submit directive wins when both appear.

use regex::Regex;
use std::sync::OnceLock;

fn final_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r#"FINAL\(\s*"((?s:.*?))"\s*\)"#).unwrap(),
            Regex::new(r"FINAL\(\s*'((?s:.*?))'\s*\)").unwrap(),
            Regex::new(r"FINAL\(\s*`((?s:.*?))`\s*\)").unwrap(),
        ]
    })
}

/// Extract the payload of a submit directive. `None` when no quoted
/// `FINAL(…)` appears anywhere in the text, fenced or not.
pub fn extract_final(text: &str) -> Option<String> {
    final_patterns()
        .iter()
        .filter_map(|pattern| {
            pattern
                .captures(text)
                .map(|captures| (captures.get(1).map(|m| m.start()), captures))
        })
        .min_by_key(|(start, _)| start.unwrap_or(usize::MAX))
        .and_then(|(_, captures)| captures.get(1).map(|m| m.as_str().to_string()))
}

/// First fenced code block, language tag stripped, trimmed. `None`
/// when the text carries no complete fence pair.
pub fn extract_code_block(text: &str) -> Option<String> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| Regex::new(r"```[a-zA-Z0-9_+-]*\n?((?s:.*?))```").unwrap());
    fence
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_with_double_quotes() {
        assert_eq!(extract_final(r#"FINAL("42")"#), Some("42".to_string()));
        assert_eq!(
            extract_final(r#"Some reasoning first. FINAL("the answer")"#),
            Some("the answer".to_string())
        );
    }

    #[test]
    fn final_with_single_quotes() {
        assert_eq!(extract_final("FINAL('done')"), Some("done".to_string()));
    }

    #[test]
    fn final_with_backticks_spans_lines() {
        assert_eq!(
            extract_final("FINAL(`line one\nline two`)"),
            Some("line one\nline two".to_string())
        );
    }

    #[test]
    fn unquoted_final_is_not_a_submit() {
        assert_eq!(extract_final("FINAL(42)"), None);
        assert_eq!(extract_final("the FINAL answer is 42"), None);
    }

    #[test]
    fn final_inside_a_code_fence_still_extracts() {
        let text = "```python\nsubmit = 'FINAL(\"42\")'\n```";
        assert_eq!(extract_final(text), Some("42".to_string()));
    }

    #[test]
    fn earliest_final_wins_across_quote_styles() {
        let text = r#"FINAL('first') and later FINAL("second")"#;
        assert_eq!(extract_final(text), Some("first".to_string()));
    }

    #[test]
    fn empty_final_payload_is_allowed() {
        assert_eq!(extract_final(r#"FINAL("")"#), Some(String::new()));
    }

    #[test]
    fn first_code_block_trimmed() {
        let text = "thinking...\n```python\nprint(1 + 1)\n```\n```python\nprint(2)\n```";
        assert_eq!(extract_code_block(text), Some("print(1 + 1)".to_string()));
    }

    #[test]
    fn bare_fence_without_language_tag() {
        assert_eq!(
            extract_code_block("```\nx = 1\n```"),
            Some("x = 1".to_string())
        );
    }

    #[test]
    fn unterminated_fence_yields_nothing() {
        assert_eq!(extract_code_block("```python\nprint(1)"), None);
        assert_eq!(extract_code_block("no code here"), None);
    }

    #[test]
    fn multiline_block_preserves_interior_lines() {
        let text = "```js\nconst a = 1;\n\nconst b = 2;\n```";
        assert_eq!(
            extract_code_block(text),
            Some("const a = 1;\n\nconst b = 2;".to_string())
        );
    }
}
