//! Stage 1: turns a seed idea (or, absent one, the project's own
//! description) into a free-form narrative plan.

use crate::cost_ledger::CostLedger;
use crate::error::Result;
use crate::providers::{GenerationClient, Message};
use crate::stages::{call_and_record, GenerationStats};

#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanResult {
    pub planning_text: String,
    pub stats: GenerationStats,
}

#[derive(Default)]
pub struct PlanningGenerator;

impl PlanningGenerator {
    pub fn new() -> Self {
        Self
    }

    pub async fn generate(
        &self,
        llm: &dyn GenerationClient,
        ledger: &CostLedger,
        project_title: &str,
        seed_idea: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<PlanResult> {
        let prompt = format!(
            "Draft a narrative plan for the novel \"{project_title}\".\n\n\
             Seed idea:\n{seed_idea}\n\n\
             Cover the central premise, the main conflict, the tone, and the overall arc. Write it as free-form prose, not a JSON document."
        );
        let messages = [Message::user(prompt)];
        let result = call_and_record(llm, ledger, &messages, temperature, max_tokens, "planning").await?;

        Ok(PlanResult {
            stats: GenerationStats::from(&result),
            planning_text: result.text.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::{test_ledger, ScriptedClient};

    #[tokio::test]
    async fn generate_returns_trimmed_plan_text_and_records_cost() {
        let client = ScriptedClient::once("  A tale of a wandering blacksmith who inherits a cursed forge.  ");
        let (_dir, ledger) = test_ledger();

        let result = PlanningGenerator::new()
            .generate(&client, &ledger, "The Cursed Forge", "a blacksmith finds a cursed hammer", 0.7, 800)
            .await
            .unwrap();

        assert_eq!(result.planning_text, "A tale of a wandering blacksmith who inherits a cursed forge.");
        assert_eq!(ledger.statistics(1).today_total, 0.001);
    }

    #[tokio::test]
    async fn generate_refuses_when_the_call_would_exceed_budget() {
        let client = ScriptedClient::once("anything");
        let dir = tempfile::tempdir().unwrap();
        let ledger = CostLedger::open(dir.path().join("ledger.json"), 0.0).unwrap();

        let err = PlanningGenerator::new()
            .generate(&client, &ledger, "T", "idea", 0.7, 800)
            .await
            .unwrap_err();

        assert!(matches!(err, crate::error::EngineError::BudgetExceeded { .. }));
    }
}
