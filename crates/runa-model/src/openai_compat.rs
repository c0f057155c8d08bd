// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use runa_config::ModelConfig;

use crate::provider::{ModelError, ModelProvider};
use crate::{CompletionRequest, CompletionResponse, Role, StopReason, ToolCallRecord};

/// Driver for any endpoint speaking the OpenAI chat-completions wire format
/// (OpenAI itself, vLLM, llama.cpp server, LiteLLM, OpenRouter, …).
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    provider_name: String,
    model: String,
    base_url: String,
    api_key: Option<String>,
    context_window: usize,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl OpenAiCompatProvider {
    pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Self> {
        let api_key = match (&cfg.api_key, &cfg.api_key_env) {
            (Some(k), _) => Some(k.clone()),
            (None, Some(env)) => std::env::var(env).ok(),
            (None, None) => None,
        };
        let base_url = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let context_window = cfg
            .context_window
            .map(|w| w as usize)
            .unwrap_or_else(|| default_context_window(&cfg.name));
        Ok(Self {
            client: reqwest::Client::new(),
            provider_name: cfg.provider.clone(),
            model: cfg.name.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            context_window,
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        })
    }

    fn wire_messages(&self, req: &CompletionRequest) -> Vec<Value> {
        let mut out = Vec::with_capacity(req.messages.len() + 1);
        if !req.system_prompt.is_empty() {
            out.push(json!({ "role": "system", "content": req.system_prompt }));
        }
        for m in &req.messages {
            match m.role {
                Role::Assistant if !m.tool_calls.is_empty() => {
                    let calls: Vec<Value> = m
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": { "name": tc.name, "arguments": tc.arguments }
                            })
                        })
                        .collect();
                    out.push(json!({
                        "role": "assistant",
                        "content": m.content,
                        "tool_calls": calls
                    }));
                }
                Role::Tool => {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
                        "content": m.content
                    }));
                }
                Role::System => out.push(json!({ "role": "system", "content": m.content })),
                Role::User => out.push(json!({ "role": "user", "content": m.content })),
                Role::Assistant => out.push(json!({ "role": "assistant", "content": m.content })),
            }
        }
        out
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let mut body = json!({
            "model": self.model,
            "messages": self.wire_messages(&req),
        });
        if let Some(t) = req.temperature.or(self.temperature) {
            body["temperature"] = json!(t);
        }
        if let Some(mt) = req.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = json!(mt);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if req.caching_enabled {
            // OpenRouter-style explicit cache key; OpenAI-proper ignores it.
            if let Some(ttl) = &req.cache_ttl {
                body["prompt_cache_ttl"] = json!(ttl);
            }
        }

        debug!(model = %self.model, messages = req.messages.len(), "chat completion request");

        let url = format!("{}/chat/completions", self.base_url);
        let mut http = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        let resp = http
            .send()
            .await
            .map_err(|e| ModelError::Timeout(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let err = match status.as_u16() {
                429 => ModelError::RateLimited(text),
                500..=599 => ModelError::Unavailable(format!("status {status}: {text}")),
                _ if text.to_ascii_lowercase().contains("overloaded") => {
                    ModelError::Unavailable(text)
                }
                _ => ModelError::Other(format!("status {status}: {text}")),
            };
            return Err(err.into());
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| ModelError::Other(format!("malformed response body: {e}")))?;
        parse_completion(&payload)
    }
}

/// Parse a chat-completions response payload into a [`CompletionResponse`].
fn parse_completion(payload: &Value) -> anyhow::Result<CompletionResponse> {
    let choice = payload["choices"]
        .get(0)
        .ok_or_else(|| ModelError::Other("response has no choices".into()))?;
    let message = &choice["message"];

    let content = message["content"].as_str().unwrap_or_default().to_string();
    // Some servers expose reasoning as `reasoning_content`, others `reasoning`.
    let reasoning = message["reasoning_content"]
        .as_str()
        .or_else(|| message["reasoning"].as_str())
        .map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for c in calls {
            if c["type"].as_str().unwrap_or("function") != "function" {
                // Non-function call types cannot be dispatched; skip them
                // rather than corrupting the history.
                continue;
            }
            tool_calls.push(ToolCallRecord {
                id: c["id"].as_str().unwrap_or_default().to_string(),
                name: c["function"]["name"].as_str().unwrap_or_default().to_string(),
                arguments: match &c["function"]["arguments"] {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
            });
        }
    }

    let stop_reason = match choice["finish_reason"].as_str() {
        Some("stop") => StopReason::EndTurn,
        Some("tool_calls") => StopReason::ToolCalls,
        Some("length") => StopReason::MaxTokens,
        _ => {
            if tool_calls.is_empty() {
                StopReason::Other
            } else {
                StopReason::ToolCalls
            }
        }
    };

    Ok(CompletionResponse {
        content,
        reasoning,
        tool_calls,
        stop_reason,
    })
}

/// Conservative context-window defaults keyed by model-name prefix.
fn default_context_window(model: &str) -> usize {
    let m = model.to_ascii_lowercase();
    if m.starts_with("gpt-4o") || m.starts_with("gpt-4.1") || m.starts_with("o1") {
        128_000
    } else if m.starts_with("gpt-4") {
        32_768
    } else if m.starts_with("claude") {
        200_000
    } else {
        32_768
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
