// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the model.
///
/// `arguments` is kept as the serialized JSON blob exactly as the provider
/// sent it; parsing happens at dispatch time so a malformed blob can be
/// reported back to the model instead of corrupting the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A single turn in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Structured reasoning emitted alongside the content, when the provider
    /// exposes it.  Not sent back on subsequent requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Tool calls carried by an assistant turn, in provider order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    /// For tool-role messages: the id of the assistant tool call answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For tool-role messages: the name of the tool that produced the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    /// Assistant turn carrying tool calls (content may be empty).
    pub fn assistant_with_calls(
        text: impl Into<String>,
        reasoning: Option<String>,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            reasoning,
            tool_calls,
            tool_call_id: None,
            tool_name: None,
            timestamp: Utc::now(),
        }
    }

    /// Tool-role message answering the call with the given id.
    pub fn tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: Some(id.into()),
            tool_name: Some(name.into()),
            timestamp: Utc::now(),
        }
    }

    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            timestamp: Utc::now(),
        }
    }

    /// Approximate token count used for context management.
    ///
    /// Uses the 4-chars-per-token heuristic; exactness is not required, but
    /// the estimate is monotone in content length.
    pub fn approx_tokens(&self) -> usize {
        let mut chars = self.content.len();
        for tc in &self.tool_calls {
            chars += tc.name.len() + tc.arguments.len();
        }
        (chars / 4).max(1)
    }
}

/// Assign missing tool-call ids and deduplicate colliding ones.
///
/// Providers occasionally emit calls with an empty id, or reuse the same id
/// for two parallel calls; either would break the call↔result pairing in the
/// history.  Synthetic ids use the `call_<n>` form.  Applying this twice
/// yields the same list as applying it once.
pub fn normalize_tool_call_ids(mut calls: Vec<ToolCallRecord>) -> Vec<ToolCallRecord> {
    use std::collections::HashSet;

    let mut seen: HashSet<String> = HashSet::new();
    let mut counter: usize = 0;
    for call in calls.iter_mut() {
        if !call.id.is_empty() && seen.insert(call.id.clone()) {
            continue;
        }
        // Empty or colliding id: pick the next free synthetic id.
        loop {
            counter += 1;
            let candidate = format!("call_{counter}");
            if seen.insert(candidate.clone()) {
                call.id = candidate;
                break;
            }
        }
    }
    calls
}

// ─── Tool schema / request / response ────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
///
/// Messages are shared `Arc`s: the caller snapshots the session without
/// copying, and tests can assert that the prompt prefix consists of the
/// same message objects across every request of a run.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Arc<Message>>,
    pub tools: Vec<ToolSchema>,
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the provider to cache the stable prompt prefix when supported.
    pub caching_enabled: bool,
    /// Cache TTL hint ("5m", "1h") for providers that accept one.
    pub cache_ttl: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolCalls,
    MaxTokens,
    Other,
}

/// Response from one completion call.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub stop_reason: StopReason,
}

impl CompletionResponse {
    /// Plain text response with no tool calls.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            stop_reason: StopReason::EndTurn,
        }
    }

    /// Response consisting of the given tool calls.
    pub fn calls(tool_calls: Vec<ToolCallRecord>) -> Self {
        Self {
            content: String::new(),
            reasoning: None,
            tool_calls,
            stop_reason: StopReason::ToolCalls,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
