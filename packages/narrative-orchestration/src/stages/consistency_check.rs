//! Audit-only consistency check over an already-written chapter. Never
//! mutates chapter state; an overridden probe text is used for the check
//! but never persisted. Like quality-check, an unparseable reply is an
//! error rather than a `parse_failed` envelope — there is no report column
//! to hold the raw text for an audit-only operation.

use crate::cost_ledger::CostLedger;
use crate::error::{EngineError, Result};
use crate::parsing::extract_json_candidate;
use crate::providers::{GenerationClient, Message};
use crate::stages::{call_and_record, GenerationStats};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConsistencyReport {
    pub overall_risk: String,
    pub summary: String,
    pub issues: Vec<serde_json::Value>,
    pub stats: GenerationStats,
}

#[derive(Default)]
pub struct ConsistencyCheckGenerator;

impl ConsistencyCheckGenerator {
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
        previous_context: &str,
        character_cards_json: &str,
        world_cards_json: &str,
        strict: bool,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<ConsistencyReport> {
        let strictness = if strict {
            "Apply strict scrutiny: flag even minor inconsistencies."
        } else {
            "Flag only clear, material inconsistencies."
        };
        let prompt = format!(
            "Check chapter {chapter_order}, \"{chapter_title}\", for consistency with established characters, world rules, and timeline.\n\
             {strictness}\n\
             Summary: {chapter_summary}\n\
             Previous context:\n{previous_context}\n\
             Characters: {character_cards_json}\n\
             World knowledge: {world_cards_json}\n\n\
             Chapter body:\n{chapter_content}\n\n\
             Respond with a single JSON object, and nothing else: \
             {{\"overall_risk\": \"low|medium|high\", \"summary\": \"...\", \"issues\": [{{\"kind\": \"...\", \"description\": \"...\", \"location\": \"...\"}}]}}"
        );
        let messages = [Message::user(prompt)];
        let result = call_and_record(llm, ledger, &messages, temperature, max_tokens, "consistency_check").await?;

        let candidate = extract_json_candidate(&result.text);
        let parsed: serde_json::Value =
            serde_json::from_str(&candidate).map_err(|_| EngineError::invalid_format("consistency check reply was not valid JSON"))?;

        let overall_risk = parsed.get("overall_risk").and_then(|v| v.as_str()).unwrap_or("medium").to_string();
        let summary = parsed.get("summary").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let issues = parsed.get("issues").and_then(|v| v.as_array()).cloned().unwrap_or_default();

        Ok(ConsistencyReport {
            overall_risk,
            summary,
            issues,
            stats: GenerationStats::from(&result),
        })
    }
}
