//! Composition root.
//!
//! Everything a [`crate::workflow_orchestrator::WorkflowOrchestrator`] needs
//! is gathered explicitly here from environment inputs, rather than read ad
//! hoc from global state at call sites — there is no process-wide
//! singleton anywhere in this crate.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::error::{EngineError, Result};
use crate::providers::ProviderCredentials;

#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationParams {
    const fn new(temperature: f32, max_tokens: u32) -> Self {
        Self { temperature, max_tokens }
    }
}

/// Per-stage `(temperature, max_tokens)` defaults. Values mirror the
/// generation parameters each stage used historically: looser temperature
/// and a larger token ceiling for open-ended prose (planning, writing),
/// tighter and shorter for audit-style JSON reports (consistency,
/// quality-check).
#[derive(Debug, Clone, Copy)]
pub struct StageDefaults {
    pub planning: GenerationParams,
    pub world_building: GenerationParams,
    pub outline: GenerationParams,
    pub detail_outline: GenerationParams,
    pub writing: GenerationParams,
    pub quality_check: GenerationParams,
    pub consistency_check: GenerationParams,
    pub rewrite: GenerationParams,
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            planning: GenerationParams::new(0.7, 800),
            world_building: GenerationParams::new(0.7, 2500),
            outline: GenerationParams::new(0.6, 4000),
            detail_outline: GenerationParams::new(0.6, 1500),
            writing: GenerationParams::new(0.8, 3000),
            quality_check: GenerationParams::new(0.3, 3000),
            consistency_check: GenerationParams::new(0.2, 1800),
            rewrite: GenerationParams::new(0.5, 3000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub default_provider: String,
    pub provider_credentials: HashMap<String, ProviderCredentials>,
    pub daily_budget: f64,
    pub cost_ledger_path: PathBuf,
    pub rewrite_history_dir: PathBuf,
    pub embedding_api_key: Option<String>,
    pub embedding_api_base: Option<String>,
    pub stage_defaults: StageDefaults,
}

impl EngineConfig {
    pub fn credentials_for(&self, provider: &str) -> Result<&ProviderCredentials> {
        self.provider_credentials
            .get(&provider.to_ascii_lowercase())
            .ok_or_else(|| EngineError::ProviderAuth(format!("no credentials configured for provider '{provider}'")))
    }

    /// Builds configuration from environment variables. Per-provider
    /// credentials are read for `openai`, `claude`, and `qwen`; any of them
    /// missing an API key is simply absent from the map rather than an
    /// error, since a deployment may only ever use one provider.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("NARRATIVE_DATABASE_URL").unwrap_or_else(|_| "sqlite://narrative.db".to_string());
        let default_provider = env::var("NARRATIVE_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let daily_budget = env::var("NARRATIVE_DAILY_BUDGET")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10.0);
        let cost_ledger_path = env::var("NARRATIVE_COST_LEDGER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/cost_ledger.json"));
        let rewrite_history_dir = env::var("NARRATIVE_REWRITE_HISTORY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/rewrite_history"));
        let embedding_api_key = env::var("NARRATIVE_EMBEDDING_API_KEY").ok().filter(|v| !v.trim().is_empty());
        let embedding_api_base = env::var("NARRATIVE_EMBEDDING_API_BASE").ok().filter(|v| !v.trim().is_empty());

        let mut provider_credentials = HashMap::new();
        for provider in ["openai", "claude", "qwen"] {
            if let Some(creds) = credentials_from_env(provider) {
                provider_credentials.insert(provider.to_string(), creds);
            }
        }

        Ok(Self {
            database_url,
            default_provider,
            provider_credentials,
            daily_budget,
            cost_ledger_path,
            rewrite_history_dir,
            embedding_api_key,
            embedding_api_base,
            stage_defaults: StageDefaults::default(),
        })
    }
}

fn credentials_from_env(provider: &str) -> Option<ProviderCredentials> {
    let upper = provider.to_ascii_uppercase();
    let api_key = env::var(format!("NARRATIVE_{upper}_API_KEY")).ok().filter(|v| !v.trim().is_empty())?;
    let base_url = env::var(format!("NARRATIVE_{upper}_BASE_URL")).ok().filter(|v| !v.trim().is_empty());
    let model = env::var(format!("NARRATIVE_{upper}_MODEL")).unwrap_or_else(|_| default_model_for(provider).to_string());
    Some(ProviderCredentials { api_key, base_url, model })
}

fn default_model_for(provider: &str) -> &'static str {
    match provider {
        "claude" => "claude-3-5-sonnet-20241022",
        "qwen" => "qwen-max",
        _ => "gpt-4o",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_defaults_give_audit_stages_a_lower_temperature_than_prose_stages() {
        let defaults = StageDefaults::default();
        assert!(defaults.quality_check.temperature < defaults.writing.temperature);
        assert!(defaults.consistency_check.temperature < defaults.planning.temperature);
    }

    #[test]
    fn credentials_for_missing_provider_is_a_provider_auth_error() {
        let config = EngineConfig {
            database_url: "sqlite::memory:".to_string(),
            default_provider: "openai".to_string(),
            provider_credentials: HashMap::new(),
            daily_budget: 10.0,
            cost_ledger_path: PathBuf::from("ledger.json"),
            rewrite_history_dir: PathBuf::from("history"),
            embedding_api_key: None,
            embedding_api_base: None,
            stage_defaults: StageDefaults::default(),
        };
        let err = config.credentials_for("openai").unwrap_err();
        assert!(matches!(err, EngineError::ProviderAuth(_)));
    }
}
