//! Shared text-extraction helpers used by the generation stages: pulling a
//! JSON candidate out of free-form LLM output, and parsing chapter-range
//! strings for batch operations.

use crate::error::{EngineError, Result};

/// Extracts the most likely JSON payload out of an LLM response. Prefers a
/// fenced ```json block (tolerating an unclosed fence, since truncated
/// output is common); falls back to the substring between the first `{`
/// and the last `}`.
pub fn extract_json_candidate(content: &str) -> String {
    let text = content.trim();
    if text.is_empty() {
        return String::new();
    }

    if let Some(candidate) = extract_fenced_block(text) {
        if !candidate.is_empty() {
            return candidate;
        }
    }

    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e > s => text[s..=e].trim().to_string(),
        (Some(s), _) => text[s..].trim().to_string(),
        _ => text.to_string(),
    }
}

fn extract_fenced_block(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let fence_start = lower.find("```")?;
    let after_fence = &text[fence_start + 3..];
    let after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
    let after_fence = after_fence.strip_prefix("JSON").unwrap_or(after_fence);
    let body = match after_fence.find("```") {
        Some(close) => &after_fence[..close],
        None => after_fence,
    };
    Some(body.trim().to_string())
}

/// Returns true when a candidate JSON string looks truncated — more `{`
/// than `}` — a signal to the caller that it should retry rather than try
/// to parse a broken object.
pub fn looks_truncated(json_candidate: &str) -> bool {
    json_candidate.matches('{').count() > json_candidate.matches('}').count()
}

/// Parses a chapter-range string into a sorted, deduplicated list of
/// 1-based chapter indices bounded by `total`.
///
/// Accepted forms: empty/absent (all chapters), a single index (`"5"`), a
/// range (`"1-10"`, start <= end), or a comma-separated mix of the above
/// (`"1,3,5-8"`).
pub fn parse_chapter_range(chapter_range: Option<&str>, total: i64) -> Result<Vec<i64>> {
    let Some(range) = chapter_range.filter(|s| !s.trim().is_empty()) else {
        return Ok((1..=total).collect());
    };

    let mut indices = Vec::new();
    for part in range.split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            let start: i64 = start
                .trim()
                .parse()
                .map_err(|_| EngineError::invalid_format(format!("invalid chapter range format: '{part}', expected 'N-M'")))?;
            let end: i64 = end
                .trim()
                .parse()
                .map_err(|_| EngineError::invalid_format(format!("invalid chapter range format: '{part}', expected 'N-M'")))?;
            if start > end {
                return Err(EngineError::invalid_format(format!(
                    "chapter range start {start} is greater than end {end}"
                )));
            }
            indices.extend(start..=end);
        } else {
            let idx: i64 = part
                .parse()
                .map_err(|_| EngineError::invalid_format(format!("invalid chapter range format: '{part}'")))?;
            indices.push(idx);
        }
    }

    let mut seen = std::collections::HashSet::new();
    let mut result: Vec<i64> = indices.into_iter().filter(|idx| *idx >= 1 && *idx <= total && seen.insert(*idx)).collect();
    result.sort_unstable();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_candidate_prefers_fenced_block() {
        let content = "here is the outline:\n```json\n{\"volumes\": []}\n```\nthanks";
        assert_eq!(extract_json_candidate(content), r#"{"volumes": []}"#);
    }

    #[test]
    fn extract_json_candidate_handles_unclosed_fence() {
        let content = "```json\n{\"volumes\": [1, 2";
        assert_eq!(extract_json_candidate(content), r#"{"volumes": [1, 2"#);
    }

    #[test]
    fn extract_json_candidate_falls_back_to_braces() {
        let content = "sure, here it is: {\"a\": 1} -- done";
        assert_eq!(extract_json_candidate(content), r#"{"a": 1}"#);
    }

    #[test]
    fn looks_truncated_detects_unbalanced_braces() {
        assert!(looks_truncated(r#"{"a": {"b": 1"#));
        assert!(!looks_truncated(r#"{"a": {"b": 1}}"#));
    }

    #[test]
    fn parse_chapter_range_empty_means_all() {
        assert_eq!(parse_chapter_range(None, 5).unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(parse_chapter_range(Some(""), 5).unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn parse_chapter_range_single_index() {
        assert_eq!(parse_chapter_range(Some("3"), 10).unwrap(), vec![3]);
    }

    #[test]
    fn parse_chapter_range_mixed_and_deduped() {
        assert_eq!(parse_chapter_range(Some("1,3,5-7,7"), 10).unwrap(), vec![1, 3, 5, 6, 7]);
    }

    #[test]
    fn parse_chapter_range_filters_out_of_bounds() {
        assert_eq!(parse_chapter_range(Some("1,99"), 5).unwrap(), vec![1]);
    }

    #[test]
    fn parse_chapter_range_rejects_inverted_range() {
        assert!(parse_chapter_range(Some("10-5"), 20).is_err());
    }

    #[test]
    fn parse_chapter_range_rejects_garbage() {
        assert!(parse_chapter_range(Some("abc"), 20).is_err());
    }
}
