use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

use super::{FinishReason, GenerateResult, GenerationClient, Message, ProviderCredentials, Role, Usage};

/// Services Anthropic's messages API, which takes `system` as a top-level
/// field rather than a message with role `system`.
pub struct ClaudeClient {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl ClaudeClient {
    pub fn new(creds: ProviderCredentials) -> Result<Self> {
        creds.validate()?;
        Ok(Self {
            http: Client::builder()
                .timeout(super::DEFAULT_REQUEST_TIMEOUT)
                .build()
                .map_err(EngineError::Http)?,
            api_key: creds.api_key,
            base_url: creds
                .base_url
                .unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
            model: creds.model,
        })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: WireUsage,
    model: String,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: String,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: i64,
    output_tokens: i64,
}

fn parse_finish_reason(s: Option<&str>) -> FinishReason {
    match s {
        Some("max_tokens") => FinishReason::Length,
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        _ => FinishReason::Other,
    }
}

#[async_trait]
impl GenerationClient for ClaudeClient {
    fn provider_name(&self) -> &str {
        "claude"
    }

    async fn generate(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<GenerateResult> {
        let system = messages.iter().find(|m| m.role == Role::System).map(|m| m.content.as_str());
        let wire_messages: Vec<WireMessage> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| WireMessage {
                role: if m.role == Role::Assistant { "assistant" } else { "user" },
                content: &m.content,
            })
            .collect();

        let request = MessagesRequest {
            model: &self.model,
            system,
            messages: wire_messages,
            temperature,
            max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::ProviderRateLimit);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(EngineError::ProviderAuth(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(EngineError::ProviderOther(format!("status {status}")));
        }

        let body: MessagesResponse = response.json().await?;
        let text = body.content.into_iter().map(|b| b.text).collect::<Vec<_>>().join("");

        let usage = Usage {
            input_tokens: body.usage.input_tokens,
            output_tokens: body.usage.output_tokens,
            total_tokens: body.usage.input_tokens + body.usage.output_tokens,
        };
        let cost = self.estimate_cost(usage.input_tokens, usage.output_tokens);

        Ok(GenerateResult {
            text,
            usage,
            cost,
            model: body.model,
            finish_reason: parse_finish_reason(body.stop_reason.as_deref()),
        })
    }

    fn count_tokens(&self, text: &str) -> i64 {
        ((text.chars().count() as f64) / 4.0).ceil() as i64
    }

    fn estimate_cost(&self, input_tokens: i64, output_tokens: i64) -> f64 {
        let (input_price, output_price) = price_per_million(&self.model);
        (input_tokens as f64 / 1_000_000.0) * input_price
            + (output_tokens as f64 / 1_000_000.0) * output_price
    }
}

fn price_per_million(model: &str) -> (f64, f64) {
    match model {
        "claude-3-5-sonnet-20241022" | "claude-3-5-sonnet-latest" => (3.00, 15.00),
        "claude-3-opus-20240229" => (15.00, 75.00),
        "claude-3-haiku-20240307" => (0.25, 1.25),
        _ => (3.00, 15.00),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_falls_back_to_sonnet_pricing() {
        assert_eq!(price_per_million("nonexistent"), price_per_million("claude-3-5-sonnet-latest"));
    }

    #[test]
    fn max_tokens_stop_reason_maps_to_length() {
        assert_eq!(parse_finish_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(parse_finish_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(parse_finish_reason(None), FinishReason::Other);
    }
}
