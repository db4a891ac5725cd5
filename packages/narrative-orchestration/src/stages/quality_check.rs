//! Stage 6: produces a multi-dimension quality report for a finished
//! chapter. Unlike the earlier structured stages, a parse failure here is
//! surfaced as an error rather than a `parse_failed` envelope: there is no
//! raw-text sibling column on `Chapter.quality_report` for a caller to fall
//! back to, so there is nothing useful to persist from a broken reply.

use crate::cost_ledger::CostLedger;
use crate::error::{EngineError, Result};
use crate::parsing::extract_json_candidate;
use crate::providers::{GenerationClient, Message};
use crate::stages::{call_and_record, GenerationStats};

#[derive(Debug, Clone, serde::Serialize)]
pub struct QualityCheckResult {
    pub report: serde_json::Value,
    pub overall_score: f64,
    pub issues_count: usize,
    pub critical_issues: usize,
    pub stats: GenerationStats,
}

#[derive(Default)]
pub struct QualityCheckGenerator;

impl QualityCheckGenerator {
    pub fn new() -> Self {
        Self
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn generate(
        &self,
        llm: &dyn GenerationClient,
        ledger: &CostLedger,
        chapter_title: &str,
        chapter_order: i64,
        chapter_summary: &str,
        chapter_content: &str,
        character_cards_json: &str,
        previous_context: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<QualityCheckResult> {
        let prompt = format!(
            "Evaluate chapter {chapter_order}, \"{chapter_title}\", for quality.\n\
             Summary: {chapter_summary}\n\
             Characters: {character_cards_json}\n\
             Previous context:\n{previous_context}\n\n\
             Chapter body:\n{chapter_content}\n\n\
             Respond with a single JSON object, and nothing else: \
             {{\"overall_score\": 0-100, \"dimension_scores\": {{\"pacing\": 0-100, \"characterization\": 0-100, \"prose\": 0-100, \"consistency\": 0-100}}, \
             \"issues\": [{{\"severity\": \"minor|major|critical\", \"dimension\": \"...\", \"location\": \"...\", \"description\": \"...\", \"suggestion\": \"...\"}}], \
             \"highlights\": [\"...\"]}}"
        );
        let messages = [Message::user(prompt)];
        let result = call_and_record(llm, ledger, &messages, temperature, max_tokens, "quality_check").await?;

        let candidate = extract_json_candidate(&result.text);
        let report: serde_json::Value =
            serde_json::from_str(&candidate).map_err(|_| EngineError::invalid_format("quality check reply was not valid JSON"))?;

        let overall_score = report.get("overall_score").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let issues = report.get("issues").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let critical_issues = issues
            .iter()
            .filter(|issue| issue.get("severity").and_then(|v| v.as_str()) == Some("critical"))
            .count();

        Ok(QualityCheckResult {
            overall_score,
            issues_count: issues.len(),
            critical_issues,
            report,
            stats: GenerationStats::from(&result),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::{test_ledger, ScriptedClient};

    #[tokio::test]
    async fn summarizes_score_and_issue_counts() {
        let client = ScriptedClient::once(
            r#"{"overall_score": 78, "dimension_scores": {"pacing": 80}, "issues": [
                {"severity": "minor", "description": "a"},
                {"severity": "critical", "description": "b"}
            ], "highlights": ["strong dialogue"]}"#,
        );
        let (_dir, ledger) = test_ledger();

        let result = QualityCheckGenerator::new()
            .generate(&client, &ledger, "T", 1, "summary", "content", "[]", "", 0.3, 3000)
            .await
            .unwrap();

        assert_eq!(result.overall_score, 78.0);
        assert_eq!(result.issues_count, 2);
        assert_eq!(result.critical_issues, 1);
    }

    #[tokio::test]
    async fn unparseable_reply_raises_an_error_instead_of_parse_failed() {
        let client = ScriptedClient::once("not json");
        let (_dir, ledger) = test_ledger();

        let err = QualityCheckGenerator::new()
            .generate(&client, &ledger, "T", 1, "summary", "content", "[]", "", 0.3, 3000)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::InvalidFormat(_)));
    }
}
