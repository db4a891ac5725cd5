use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

use super::{FinishReason, GenerateResult, GenerationClient, Message, ProviderCredentials, Role, Usage};

/// Services Alibaba DashScope's OpenAI-compatible-ish chat endpoint. Usage
/// accounting here is weaker than OpenAI's — when the endpoint omits usage
/// counts, a character-length heuristic stands in (see `count_tokens`).
pub struct QwenClient {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl QwenClient {
    pub fn new(creds: ProviderCredentials) -> Result<Self> {
        creds.validate()?;
        Ok(Self {
            http: Client::builder()
                .timeout(super::DEFAULT_REQUEST_TIMEOUT)
                .build()
                .map_err(EngineError::Http)?,
            api_key: creds.api_key,
            base_url: creds.base_url.unwrap_or_else(|| {
                "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
            }),
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

/// Character-length heuristic: roughly one token per 1.7 Chinese-heavy
/// characters, the per-provider fallback the component design calls for
/// when DashScope doesn't report usage.
fn character_heuristic_tokens(text: &str) -> i64 {
    ((text.chars().count() as f64) / 1.7).ceil() as i64
}

#[async_trait]
impl GenerationClient for QwenClient {
    fn provider_name(&self) -> &str {
        "qwen"
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
                let input: i64 = messages
                    .iter()
                    .map(|m| character_heuristic_tokens(&m.content))
                    .sum();
                let output = character_heuristic_tokens(&choice.message.content);
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
        character_heuristic_tokens(text)
    }

    fn estimate_cost(&self, input_tokens: i64, output_tokens: i64) -> f64 {
        let (input_price, output_price) = price_per_million(&self.model);
        (input_tokens as f64 / 1_000_000.0) * input_price
            + (output_tokens as f64 / 1_000_000.0) * output_price
    }
}

fn price_per_million(model: &str) -> (f64, f64) {
    match model {
        "qwen-max" => (2.80, 8.40),
        "qwen-plus" => (0.70, 2.10),
        "qwen-turbo" => (0.30, 0.60),
        _ => (1.00, 3.00),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn character_heuristic_scales_with_length() {
        let short = character_heuristic_tokens("abc");
        let long = character_heuristic_tokens(&"abc".repeat(100));
        assert!(long > short * 50);
    }
}
