//! Stage 2: invents world items and principal characters from the planning
//! text. On a parse failure the raw reply is handed back for the caller to
//! persist verbatim; no character or world item is created in that case.

use serde::{Deserialize, Serialize};

use crate::cost_ledger::CostLedger;
use crate::error::Result;
use crate::parsing::extract_json_candidate;
use crate::providers::{GenerationClient, Message};
use crate::stages::{call_and_record, GenerationStats};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorldItemDraft {
    pub data_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(default)]
    pub lorebook_keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CharacterDraft {
    pub name: String,
    #[serde(default)]
    pub archetype: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub lorebook_keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorldBuildingDraft {
    #[serde(default)]
    pub world_data: Vec<WorldItemDraft>,
    #[serde(default)]
    pub characters: Vec<CharacterDraft>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorldBuildingResult {
    pub draft: Option<WorldBuildingDraft>,
    pub raw_content: String,
    pub parse_failed: bool,
    pub stats: GenerationStats,
}

#[derive(Default)]
pub struct WorldBuildingGenerator;

impl WorldBuildingGenerator {
    pub fn new() -> Self {
        Self
    }

    pub async fn generate(
        &self,
        llm: &dyn GenerationClient,
        ledger: &CostLedger,
        planning_text: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<WorldBuildingResult> {
        let prompt = format!(
            "Based on the following narrative plan, invent the world and its principal characters.\n\n\
             Plan:\n{planning_text}\n\n\
             Respond with a single JSON object of this shape, and nothing else:\n\
             {{\"world_data\": [{{\"data_type\": \"location|organization|item|rule\", \"name\": \"...\", \"description\": \"...\", \"properties\": {{}}, \"lorebook_keywords\": [\"...\"]}}], \
             \"characters\": [{{\"name\": \"...\", \"archetype\": \"...\", \"background\": \"...\", \"goals\": [\"...\"], \"lorebook_keywords\": [\"...\"]}}]}}"
        );
        let messages = [Message::user(prompt)];
        let result = call_and_record(llm, ledger, &messages, temperature, max_tokens, "world_building").await?;

        let candidate = extract_json_candidate(&result.text);
        let draft: Option<WorldBuildingDraft> = serde_json::from_str(&candidate).ok();

        Ok(WorldBuildingResult {
            parse_failed: draft.is_none(),
            draft,
            raw_content: result.text.clone(),
            stats: GenerationStats::from(&result),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::{test_ledger, ScriptedClient};

    #[tokio::test]
    async fn parses_world_data_and_characters_on_success() {
        let client = ScriptedClient::once(
            r#"```json
            {"world_data": [{"data_type": "location", "name": "Ashford", "description": "a border town"}],
             "characters": [{"name": "Mira", "archetype": "reluctant hero", "goals": ["find her brother"]}]}
            ```"#,
        );
        let (_dir, ledger) = test_ledger();

        let result = WorldBuildingGenerator::new().generate(&client, &ledger, "plan text", 0.7, 2000).await.unwrap();

        assert!(!result.parse_failed);
        let draft = result.draft.unwrap();
        assert_eq!(draft.world_data.len(), 1);
        assert_eq!(draft.world_data[0].name, "Ashford");
        assert_eq!(draft.characters[0].name, "Mira");
    }

    #[tokio::test]
    async fn unparseable_reply_sets_parse_failed_and_keeps_raw_content() {
        let client = ScriptedClient::once("sorry, I can't help with that.");
        let (_dir, ledger) = test_ledger();

        let result = WorldBuildingGenerator::new().generate(&client, &ledger, "plan text", 0.7, 2000).await.unwrap();

        assert!(result.parse_failed);
        assert!(result.draft.is_none());
        assert_eq!(result.raw_content, "sorry, I can't help with that.");
    }
}
