//! Stage 3: produces the volume/chapter tree for a project.
//!
//! A reply cut off mid-JSON is retried once: the truncated text is fed back
//! to the model as its own prior turn, with an instruction to continue from
//! where it stopped, and the two replies are concatenated before parsing.

use serde::{Deserialize, Serialize};

use crate::cost_ledger::CostLedger;
use crate::error::Result;
use crate::parsing::{extract_json_candidate, looks_truncated};
use crate::providers::{FinishReason, GenerateResult, GenerationClient, Message};
use crate::stages::{call_and_record, GenerationStats};

const CONTINUATION_INSTRUCTION: &str =
    "Your previous reply was cut off. Continue the JSON document exactly from where it left off. \
     Do not repeat earlier content, do not add commentary, and do not restart the object.";
const MAX_CONTINUATION_TOKENS: u32 = 12_000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChapterDraft {
    pub title: String,
    pub order: i64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_events: Vec<String>,
    #[serde(default)]
    pub characters_involved: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VolumeDraft {
    pub title: String,
    pub order: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub chapters: Vec<ChapterDraft>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutlineDraft {
    pub volumes: Vec<VolumeDraft>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutlineResult {
    pub draft: Option<OutlineDraft>,
    pub raw_content: String,
    pub parse_failed: bool,
    pub stats: GenerationStats,
}

#[derive(Default)]
pub struct OutlineGenerator;

impl OutlineGenerator {
    pub fn new() -> Self {
        Self
    }

    pub async fn generate(
        &self,
        llm: &dyn GenerationClient,
        ledger: &CostLedger,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<OutlineResult> {
        let messages = vec![Message::user(prompt.to_string())];
        let first = call_and_record(llm, ledger, &messages, temperature, max_tokens, "outline").await?;

        if let Some(draft) = try_parse(&first.text) {
            return Ok(OutlineResult {
                draft: Some(draft),
                raw_content: first.text.clone(),
                parse_failed: false,
                stats: GenerationStats::from(&first),
            });
        }

        if !was_truncated(&first) {
            return Ok(OutlineResult {
                draft: None,
                raw_content: first.text.clone(),
                parse_failed: true,
                stats: GenerationStats::from(&first),
            });
        }

        let continuation_messages = vec![
            Message::user(prompt.to_string()),
            Message::assistant(first.text.clone()),
            Message::user(CONTINUATION_INSTRUCTION.to_string()),
        ];
        let continuation_max_tokens = (max_tokens.saturating_mul(2)).min(MAX_CONTINUATION_TOKENS);
        let second = call_and_record(llm, ledger, &continuation_messages, temperature, continuation_max_tokens, "outline").await?;

        let merged_content = format!("{}{}", first.text, second.text);
        let draft = try_parse(&merged_content);

        Ok(OutlineResult {
            parse_failed: draft.is_none(),
            draft,
            raw_content: merged_content,
            stats: GenerationStats::combine(&first, &second),
        })
    }
}

fn was_truncated(result: &GenerateResult) -> bool {
    result.finish_reason == FinishReason::Length || looks_truncated(&extract_json_candidate(&result.text))
}

/// Parses and structurally validates a candidate outline: `volumes` must be
/// non-empty, and every volume and chapter needs a `title`. A syntactically
/// valid JSON document missing those still counts as a parse failure.
fn try_parse(content: &str) -> Option<OutlineDraft> {
    let candidate = extract_json_candidate(content);
    if looks_truncated(&candidate) {
        return None;
    }
    let draft: OutlineDraft = serde_json::from_str(&candidate).ok()?;
    if draft.volumes.is_empty() {
        return None;
    }
    for volume in &draft.volumes {
        if volume.title.trim().is_empty() {
            return None;
        }
        for chapter in &volume.chapters {
            if chapter.title.trim().is_empty() {
                return None;
            }
        }
    }
    Some(draft)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::{ok_result, test_ledger, ScriptedClient};

    fn sample_outline() -> &'static str {
        r#"{"volumes": [{"title": "Volume One", "order": 1, "chapters": [
            {"title": "Beginnings", "order": 1, "summary": "the hero sets out", "key_events": ["departs home"]}
        ]}]}"#
    }

    #[tokio::test]
    async fn parses_a_complete_outline_on_the_first_reply() {
        let client = ScriptedClient::once(sample_outline());
        let (_dir, ledger) = test_ledger();

        let result = OutlineGenerator::new().generate(&client, &ledger, "outline prompt", 0.6, 4000).await.unwrap();

        assert!(!result.parse_failed);
        let draft = result.draft.unwrap();
        assert_eq!(draft.volumes[0].chapters[0].title, "Beginnings");
    }

    #[tokio::test]
    async fn retries_once_and_merges_on_truncation() {
        let first_text = r#"{"volumes": [{"title": "Volume One", "order": 1, "chapters": [
            {"title": "Beginnings", "order": 1"#;
        let second_text = r#", "summary": "the hero sets out"}]}]}"#;

        let client = ScriptedClient::new(vec![
            Ok(ok_result(first_text, FinishReason::Length)),
            Ok(ok_result(second_text, FinishReason::Stop)),
        ]);
        let (_dir, ledger) = test_ledger();

        let result = OutlineGenerator::new().generate(&client, &ledger, "outline prompt", 0.6, 4000).await.unwrap();

        assert!(!result.parse_failed);
        let draft = result.draft.unwrap();
        assert_eq!(draft.volumes[0].chapters[0].title, "Beginnings");
        assert_eq!(result.stats.cost, 0.002);
    }

    #[tokio::test]
    async fn does_not_retry_when_not_truncated() {
        let client = ScriptedClient::once("not json at all");
        let (_dir, ledger) = test_ledger();

        let result = OutlineGenerator::new().generate(&client, &ledger, "outline prompt", 0.6, 4000).await.unwrap();

        assert!(result.parse_failed);
        assert_eq!(result.raw_content, "not json at all");
    }

    #[tokio::test]
    async fn missing_required_keys_counts_as_parse_failure_even_though_json_is_valid() {
        let client = ScriptedClient::once(r#"{"volumes": [{"order": 1, "chapters": []}]}"#);
        let (_dir, ledger) = test_ledger();

        let result = OutlineGenerator::new().generate(&client, &ledger, "outline prompt", 0.6, 4000).await.unwrap();

        assert!(result.parse_failed);
    }
}
