//! AI completion backend.
//!
//! [`AiBackend`] turns a pass's prompt template and the invocation context
//! into a single completion request. The HTTP side lives behind the
//! [`CompletionClient`] trait:
//! - **[`OpenAiClient`]** calls an OpenAI-compatible `POST /chat/completions`
//!   endpoint with a request timeout and bounded retries.
//! - **[`UnavailableClient`]** stands in when the provider is disabled or the
//!   API key is missing; every call fails with
//!   [`BackendError::Unavailable`].
//!
//! # Prompt templates
//!
//! `{{path}}`, `{{language}}`, `{{source}}`, `{{parsed}}`,
//! `{{previous_results}}`, and `{{context}}` are substituted. A template that
//! references none of the content placeholders gets the combined context
//! appended after a blank line.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AiConfig;
use crate::error::BackendError;
use crate::models::{PassOutput, Usage};
use crate::registry::{BackendSpec, PassDefinition};

use super::{Backend, BackendOutput, InvocationContext};

const BACKEND: &str = "ai";

const CONTENT_PLACEHOLDERS: [&str; 4] = [
    "{{source}}",
    "{{parsed}}",
    "{{previous_results}}",
    "{{context}}",
];

/// One completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// Transport to a text-completion API.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, BackendError>;
}

/// Backend for passes declared with `backend = "ai"`.
pub struct AiBackend {
    client: Arc<dyn CompletionClient>,
}

impl AiBackend {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Backend for AiBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn invoke(
        &self,
        pass: &PassDefinition,
        ctx: &InvocationContext,
    ) -> Result<BackendOutput, BackendError> {
        let params = match &pass.backend {
            BackendSpec::Ai(p) => p,
            other => {
                return Err(BackendError::invocation(
                    BACKEND,
                    format!("pass '{}' is a {} pass", pass.name, other.label()),
                ))
            }
        };

        let prompt = render_prompt(&params.prompt, ctx);
        let request = CompletionRequest {
            model: params.model.clone(),
            system: params.system.clone(),
            prompt: prompt.clone(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        };

        let completion = self.client.complete(&request).await?;
        let text = completion.text.trim().to_string();
        if text.is_empty() {
            return Err(BackendError::invocation(BACKEND, "empty completion"));
        }

        Ok(BackendOutput {
            input: prompt,
            output: PassOutput::Text(text),
            usage: Some(completion.usage),
        })
    }
}

/// Substitute `{{key}}` placeholders in a pass template.
pub fn render_prompt(template: &str, ctx: &InvocationContext) -> String {
    let combined = ctx.combined();
    let mut prompt = substitute(template, |key| match key {
        "path" => Some(ctx.artifact_path.as_str()),
        "language" => Some(ctx.language.as_deref().unwrap_or("unknown")),
        "source" => Some(ctx.source.as_deref().unwrap_or("")),
        "parsed" => Some(ctx.parsed.as_deref().unwrap_or("")),
        "previous_results" => Some(ctx.previous_results.as_deref().unwrap_or("")),
        "context" => Some(combined.as_str()),
        _ => None,
    });

    let references_content = CONTENT_PLACEHOLDERS.iter().any(|p| template.contains(p));
    if !references_content && !combined.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(&combined);
    }
    prompt
}

/// Single left-to-right pass, so substituted text is never re-expanded.
/// Unknown keys are left as written.
fn substitute<'a>(template: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = &after[..end];
        match lookup(key.trim()) {
            Some(value) => out.push_str(value),
            None => {
                out.push_str("{{");
                out.push_str(key);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

// ============ Clients ============

/// Pick the completion client for the configured provider.
pub fn create_client(config: &AiConfig) -> Arc<dyn CompletionClient> {
    if !config.is_enabled() {
        return Arc::new(UnavailableClient::new("ai provider is disabled"));
    }
    match config.provider.as_str() {
        "openai" => match OpenAiClient::new(config) {
            Ok(client) => Arc::new(client),
            Err(e) => Arc::new(UnavailableClient::new(e.to_string())),
        },
        other => Arc::new(UnavailableClient::new(format!("unknown ai provider '{}'", other))),
    }
}

/// Client that always reports the backend as unavailable.
pub struct UnavailableClient {
    reason: String,
}

impl UnavailableClient {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CompletionClient for UnavailableClient {
    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, BackendError> {
        Err(BackendError::unavailable(BACKEND, self.reason.clone()))
    }
}

/// Chat-completions client for OpenAI-compatible APIs.
///
/// Reads the API key from the environment variable named by
/// `ai.api_key_env` (default `OPENAI_API_KEY`).
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAiClient {
    /// # Errors
    ///
    /// [`BackendError::Unavailable`] if the API key variable is not set.
    pub fn new(config: &AiConfig) -> Result<Self, BackendError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            BackendError::unavailable(
                BACKEND,
                format!("{} environment variable not set", config.api_key_env),
            )
        })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackendError::unavailable(BACKEND, e.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, BackendError> {
        let body = build_request_body(request);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(attempt, delay_secs = delay.as_secs(), "retrying completion");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            BackendError::invocation(BACKEND, format!("malformed response: {}", e))
                        })?;
                        return parse_completion(&json, &request.model);
                    }

                    let body_text = response.text().await.unwrap_or_default();

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(BackendError::invocation(
                            BACKEND,
                            format!("API error {}: {}", status, body_text),
                        ));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    return Err(BackendError::invocation(
                        BACKEND,
                        format!("API error {}: {}", status, body_text),
                    ));
                }
                Err(e) => {
                    last_err = Some(BackendError::invocation(BACKEND, e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| BackendError::invocation(BACKEND, "completion failed after retries")))
    }
}

fn build_request_body(request: &CompletionRequest) -> serde_json::Value {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(serde_json::json!({ "role": "system", "content": system }));
    }
    messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

    serde_json::json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    })
}

/// Extract `choices[0].message.content` and the `usage` block.
fn parse_completion(json: &serde_json::Value, model: &str) -> Result<Completion, BackendError> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            BackendError::invocation(BACKEND, "malformed response: missing choices[0].message.content")
        })?;

    let usage = json.get("usage");
    let count = |field: &str| {
        usage
            .and_then(|u| u.get(field))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };

    Ok(Completion {
        text: text.to_string(),
        usage: Usage {
            model: json
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or(model)
                .to_string(),
            prompt_tokens: count("prompt_tokens"),
            completion_tokens: count("completion_tokens"),
            total_tokens: count("total_tokens"),
        },
    })
}
