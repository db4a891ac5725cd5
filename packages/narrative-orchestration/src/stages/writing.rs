//! Stage 5: writes a chapter's prose from its outline, the assembled
//! context bundle, and a style guide.

use crate::context_assembler::ContextBundle;
use crate::cost_ledger::CostLedger;
use crate::error::Result;
use crate::providers::{GenerationClient, Message};
use crate::stages::{call_and_record, GenerationStats};

#[derive(Debug, Clone, serde::Serialize)]
pub struct WritingResult {
    pub content: String,
    pub stats: GenerationStats,
}

#[derive(Default)]
pub struct WritingGenerator;

impl WritingGenerator {
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
        chapter_outline: &str,
        bundle: &ContextBundle,
        style_guide: &str,
        author_note: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<WritingResult> {
        let character_cards = serde_json::to_string(&bundle.character_memory_cards).unwrap_or_default();
        let world_cards = serde_json::to_string(&bundle.world_memory_cards).unwrap_or_default();
        let plot_cards = serde_json::to_string(&bundle.plot_arc_cards).unwrap_or_default();
        let note_line = author_note
            .filter(|n| !n.trim().is_empty())
            .map(|n| format!("\nAuthor's note: {n}"))
            .unwrap_or_default();

        let prompt = format!(
            "Write chapter {chapter_order}, \"{chapter_title}\", in full prose.\n\n\
             Chapter outline:\n{chapter_outline}\n\n\
             Previous context:\n{}\n\n\
             Relevant characters: {character_cards}\n\
             Relevant world knowledge: {world_cards}\n\
             Active foreshadowing to weave in or pay off: {plot_cards}\n\n\
             Style guide: {style_guide}{note_line}\n\n\
             Write only the chapter body — no title, no section headers, no author commentary.",
            bundle.previous_context,
        );

        let messages = [Message::user(prompt)];
        let result = call_and_record(llm, ledger, &messages, temperature, max_tokens, "writing").await?;

        Ok(WritingResult {
            content: result.text.trim().to_string(),
            stats: GenerationStats::from(&result),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::{test_ledger, ScriptedClient};

    fn empty_bundle() -> ContextBundle {
        ContextBundle {
            previous_context: "This is the opening chapter; there is no prior context.".to_string(),
            character_memory_cards: Vec::new(),
            world_memory_cards: Vec::new(),
            plot_arc_cards: Vec::new(),
        }
    }

    #[tokio::test]
    async fn generate_returns_trimmed_chapter_body() {
        let client = ScriptedClient::once("  Mira stepped onto the frost-bitten road.  ");
        let (_dir, ledger) = test_ledger();
        let bundle = empty_bundle();

        let result = WritingGenerator::new()
            .generate(&client, &ledger, "Departure", 1, "Mira leaves home", &bundle, "terse, present-tense", None, 0.8, 3000)
            .await
            .unwrap();

        assert_eq!(result.content, "Mira stepped onto the frost-bitten road.");
    }

    #[tokio::test]
    async fn author_note_is_only_included_when_present() {
        let client = ScriptedClient::once("body");
        let (_dir, ledger) = test_ledger();
        let bundle = empty_bundle();

        WritingGenerator::new()
            .generate(&client, &ledger, "T", 1, "outline", &bundle, "guide", Some("keep it short"), 0.8, 3000)
            .await
            .unwrap();
    }
}
