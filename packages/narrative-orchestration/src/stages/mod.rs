//! One generator per pipeline stage.
//!
//! Every generator here is a stateless service: it takes already-resolved
//! inputs (the caller is responsible for gathering them from persistence),
//! renders a prompt, calls a provider, parses the reply, and returns a
//! result; persisting that result is the caller's job. This mirrors the
//! provider clients' own shape — no mutable state beyond what's passed in —
//! and keeps every generator trivially testable against a scripted client.

pub mod consistency_check;
pub mod detail_outline;
pub mod outline;
pub mod planning;
pub mod quality_check;
pub mod rewrite;
pub mod rollback;
pub mod world_building;
pub mod writing;

use narrative_storage::repository::ChapterRepository;
use narrative_storage::Database;
use serde::Serialize;

use crate::cost_ledger::CostLedger;
use crate::error::{EngineError, Result};
use crate::providers::{with_retry, GenerateResult, GenerationClient, Message, Usage};

/// Checks the ledger before placing the call (so a budget breach is raised
/// without ever reaching the provider), calls it with bounded retry, then
/// records the actual cost. The pre-check uses `max_tokens` as a pessimistic
/// stand-in for output tokens, since the real count isn't known until the
/// call returns.
pub(crate) async fn call_and_record(
    llm: &dyn GenerationClient,
    ledger: &CostLedger,
    messages: &[Message],
    temperature: f32,
    max_tokens: u32,
    task_tag: &str,
) -> Result<GenerateResult> {
    let prompt_tokens: i64 = messages.iter().map(|m| llm.count_tokens(&m.content)).sum();
    let projected_cost = llm.estimate_cost(prompt_tokens, max_tokens as i64);
    if !ledger.check_budget(projected_cost) {
        let stats = ledger.statistics(1);
        return Err(EngineError::BudgetExceeded {
            today_total: stats.today_total,
            daily_budget: stats.daily_budget,
        });
    }

    let result = with_retry(|| llm.generate(messages, temperature, max_tokens)).await?;
    ledger.add(
        result.cost,
        result.usage.input_tokens,
        result.usage.output_tokens,
        llm.provider_name(),
        &result.model,
        task_tag,
    )?;
    Ok(result)
}

/// Usage/cost/model summary attached to every generator's result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationStats {
    pub usage: Option<Usage>,
    pub cost: f64,
    pub model: Option<String>,
}

impl From<&GenerateResult> for GenerationStats {
    fn from(result: &GenerateResult) -> Self {
        Self {
            usage: Some(result.usage),
            cost: result.cost,
            model: Some(result.model.clone()),
        }
    }
}

impl GenerationStats {
    fn combine(a: &GenerateResult, b: &GenerateResult) -> Self {
        Self {
            usage: Some(Usage {
                input_tokens: a.usage.input_tokens + b.usage.input_tokens,
                output_tokens: a.usage.output_tokens + b.usage.output_tokens,
                total_tokens: a.usage.total_tokens + b.usage.total_tokens,
            }),
            cost: a.cost + b.cost,
            model: Some(b.model.clone()),
        }
    }
}

const NO_PRIOR_CHAPTERS_PLACEHOLDER: &str = "This is the opening chapter; there is no prior context.";

/// Lightweight recap used by detail-outline and quality-check: the last few
/// chapters' cached summaries (or a placeholder when none is cached yet),
/// joined as-is. Unlike [`crate::context_assembler::ContextAssembler`]'s
/// recap, this never calls a model and never compresses — it's a cheap
/// "what happened recently" hint, not a budget-aware narrative digest.
pub async fn simple_recap(db: &Database, volume_id: i64, current_order: i64, window_size: i64) -> Result<String> {
    if current_order <= 1 {
        return Ok(NO_PRIOR_CHAPTERS_PLACEHOLDER.to_string());
    }

    let chapters = ChapterRepository::new(&db.pool);
    let start_order = (current_order - window_size).max(1);

    let mut fragments = Vec::new();
    for order in start_order..current_order {
        if let Ok(chapter) = chapters.get_by_order(volume_id, order).await {
            let summary = chapter
                .summary
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "(not yet summarized)".to_string());
            fragments.push(format!("Chapter {} {}: {}", chapter.order, chapter.title, summary));
        }
    }

    if fragments.is_empty() {
        return Ok(NO_PRIOR_CHAPTERS_PLACEHOLDER.to_string());
    }
    Ok(fragments.join("\n"))
}
