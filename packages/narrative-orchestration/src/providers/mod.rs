//! Uniform generation-provider abstraction.
//!
//! One `GenerationClient` trait services all chat-style providers; a
//! registry maps a case-insensitive provider name to a constructed client,
//! falling back to an OpenAI-compatible implementation for any name it
//! doesn't recognize, per the component design's provider registry contract.

mod claude;
mod openai;
mod qwen;

pub use claude::ClaudeClient;
pub use openai::OpenAiClient;
pub use qwen::QwenClient;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, Result};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResult {
    pub text: String,
    pub usage: Usage,
    pub cost: f64,
    pub model: String,
    pub finish_reason: FinishReason,
}

/// Uniform contract every provider client implements.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn generate(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<GenerateResult>;

    fn count_tokens(&self, text: &str) -> i64;

    fn estimate_cost(&self, input_tokens: i64, output_tokens: i64) -> f64;
}

/// Retries `op` up to [`MAX_RETRY_ATTEMPTS`] times with exponential backoff
/// (~2s, ~4s, ~8s) when it fails with a rate-limit error. Token-limit and
/// auth errors are never retried — they're surfaced on the first attempt.
pub async fn with_retry<F, Fut>(mut op: F) -> Result<GenerateResult>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<GenerateResult>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() && attempt < MAX_RETRY_ATTEMPTS => {
                let backoff = Duration::from_secs(2u64.pow(attempt));
                warn!(attempt, backoff_secs = backoff.as_secs(), "retrying after rate limit");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A provider name plus the credential field it expects, used to validate
/// construction before a client is cached.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: String,
}

impl ProviderCredentials {
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() || self.api_key == "placeholder" {
            return Err(EngineError::ProviderAuth(
                "missing or placeholder API key".into(),
            ));
        }
        Ok(())
    }
}

/// Maps a case-insensitive provider name to a constructed client, caching by
/// `(provider, model)`. Any name not among the three built-ins is serviced by
/// the OpenAI-compatible client, matching the component design's "any name
/// not built in is treated as OpenAI-compatible" rule.
pub struct ProviderRegistry {
    cache: RwLock<HashMap<(String, String), Arc<dyn GenerationClient>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(
        &self,
        provider: &str,
        creds: &ProviderCredentials,
    ) -> Result<Arc<dyn GenerationClient>> {
        let key = (provider.to_ascii_lowercase(), creds.model.clone());
        if let Some(client) = self.cache.read().get(&key) {
            return Ok(client.clone());
        }

        creds.validate()?;
        let client: Arc<dyn GenerationClient> = match key.0.as_str() {
            "claude" => Arc::new(ClaudeClient::new(creds.clone())?),
            "qwen" => Arc::new(QwenClient::new(creds.clone())?),
            _ => Arc::new(OpenAiClient::new(creds.clone())?),
        };

        self.cache.write().insert(key, client.clone());
        Ok(client)
    }

    /// Pre-populates the cache with a fixed client, bypassing real provider
    /// construction. Lets callers exercise the orchestration layer without
    /// a network round trip.
    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, provider: &str, model: &str, client: Arc<dyn GenerationClient>) {
        self.cache.write().insert((provider.to_ascii_lowercase(), model.to_string()), client);
    }
}
