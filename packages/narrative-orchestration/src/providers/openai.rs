use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

use super::{FinishReason, GenerateResult, GenerationClient, Message, ProviderCredentials, Role, Usage};

/// Services the OpenAI chat-completions wire format. Also used for any
/// unregistered provider name and for user-configured OpenAI-compatible
/// endpoints, since its `base_url` is overridable.
pub struct OpenAiClient {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
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
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: creds.model,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
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
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    model: String,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn parse_finish_reason(s: Option<&str>) -> FinishReason {
    match s {
        Some("length") => FinishReason::Length,
        Some("stop") => FinishReason::Stop,
        _ => FinishReason::Other,
    }
}

/// ~4 characters per token for English/OpenAI-family tokenizers, a common
/// order-of-magnitude approximation when the real tokenizer isn't linked in.
fn approximate_token_count(text: &str) -> i64 {
    ((text.chars().count() as f64) / 4.0).ceil() as i64
}

#[async_trait]
impl GenerationClient for OpenAiClient {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn generate(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<GenerateResult> {
        let wire_messages: Vec<WireMessage> = messages
            .iter()
            .map(|m| WireMessage {
                role: role_str(m.role),
                content: &m.content,
            })
            .collect();

        let request = ChatRequest {
            model: &self.model,
            messages: wire_messages,
            temperature,
            max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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

        let body: ChatResponse = response.json().await?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ProviderOther("empty choices array".into()))?;

        let (input_tokens, output_tokens, total_tokens) = match body.usage {
            Some(u) => (u.prompt_tokens, u.completion_tokens, u.total_tokens),
            None => {
                let input = messages.iter().map(|m| approximate_token_count(&m.content)).sum();
                let output = approximate_token_count(&choice.message.content);
                (input, output, input + output)
            }
        };

        let cost = self.estimate_cost(input_tokens, output_tokens);

        Ok(GenerateResult {
            text: choice.message.content,
            usage: Usage {
                input_tokens,
                output_tokens,
                total_tokens,
            },
            cost,
            model: body.model,
            finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
        })
    }

    fn count_tokens(&self, text: &str) -> i64 {
        approximate_token_count(text)
    }

    fn estimate_cost(&self, input_tokens: i64, output_tokens: i64) -> f64 {
        let (input_price, output_price) = price_per_million(&self.model);
        (input_tokens as f64 / 1_000_000.0) * input_price
            + (output_tokens as f64 / 1_000_000.0) * output_price
    }
}

/// Per-model USD price per million tokens (input, output). Unknown models
/// fall back to a conservative default for the family.
fn price_per_million(model: &str) -> (f64, f64) {
    match model {
        "gpt-4o" => (2.50, 10.00),
        "gpt-4o-mini" => (0.15, 0.60),
        "gpt-4-turbo" => (10.00, 30.00),
        _ => (5.00, 15.00),
    }
}
