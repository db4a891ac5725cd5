//! Stage 4: produces a scene-by-scene breakdown for a single chapter.

use serde::{Deserialize, Serialize};

use crate::cost_ledger::CostLedger;
use crate::error::Result;
use crate::parsing::extract_json_candidate;
use crate::providers::{GenerationClient, Message};
use crate::stages::{call_and_record, GenerationStats};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DetailOutlineDraft {
    #[serde(default)]
    pub scenes: Vec<serde_json::Value>,
    #[serde(default)]
    pub chapter_goal: String,
    #[serde(default)]
    pub emotional_tone: String,
    #[serde(default)]
    pub cliffhanger: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailOutlineResult {
    pub draft: Option<DetailOutlineDraft>,
    pub raw_content: String,
    pub parse_failed: bool,
    pub stats: GenerationStats,
}

#[derive(Default)]
pub struct DetailOutlineGenerator;

impl DetailOutlineGenerator {
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
        key_events: &[String],
        characters_involved: &[String],
        world_context: &str,
        previous_context: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<DetailOutlineResult> {
        let key_events_line = if key_events.is_empty() {
            "(none recorded)".to_string()
        } else {
            key_events.join("; ")
        };
        let characters_line = if characters_involved.is_empty() {
            "(none recorded)".to_string()
        } else {
            characters_involved.join(", ")
        };

        let prompt = format!(
            "Build a detailed scene-by-scene outline for chapter {chapter_order}, \"{chapter_title}\".\n\
             Outline summary: {chapter_summary}\n\
             Key events: {key_events_line}\n\
             Characters involved: {characters_line}\n\
             Relevant world knowledge:\n{world_context}\n\
             Previous context:\n{previous_context}\n\n\
             Respond with a single JSON object, and nothing else: \
             {{\"scenes\": [{{\"title\": \"...\", \"summary\": \"...\", \"pov_character\": \"...\", \"setting\": \"...\"}}], \
             \"chapter_goal\": \"...\", \"emotional_tone\": \"...\", \"cliffhanger\": \"...\"}}"
        );
        let messages = [Message::user(prompt)];
        let result = call_and_record(llm, ledger, &messages, temperature, max_tokens, "detail_outline").await?;

        let candidate = extract_json_candidate(&result.text);
        let draft: Option<DetailOutlineDraft> = serde_json::from_str(&candidate).ok();

        Ok(DetailOutlineResult {
            parse_failed: draft.is_none(),
            draft,
            raw_content: result.text.clone(),
            stats: GenerationStats::from(&result),
        })
    }
}
