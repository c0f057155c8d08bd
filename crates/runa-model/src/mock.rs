// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{CompletionRequest, CompletionResponse, ToolCallRecord};

/// A pre-scripted mock provider.  Each `complete` call pops the next response
/// from the front of the queue; every request is recorded so tests can
/// inspect exactly what was sent (tool schemas, prompt prefix, system text).
///
/// When the script runs dry the provider keeps returning the last response —
/// convenient for loop-detection tests that need the same output many times.
pub struct ScriptedProvider {
    name: String,
    model: String,
    context_window: usize,
    scripts: Mutex<VecDeque<CompletionResponse>>,
    last: Mutex<Option<CompletionResponse>>,
    prompt_replies: Mutex<VecDeque<String>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            name: "mock".into(),
            model: "scripted-mock".into(),
            context_window: 32_768,
            scripts: Mutex::new(responses.into()),
            last: Mutex::new(None),
            prompt_replies: Mutex::new(VecDeque::new()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Provider that always returns the same text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![CompletionResponse::text(reply)])
    }

    /// Provider that emits one tool call, then a final text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            CompletionResponse::calls(vec![ToolCallRecord {
                id: tool_id.into(),
                name: tool_name.into(),
                arguments: args_json.into(),
            }]),
            CompletionResponse::text(final_text),
        ])
    }

    /// Override the claimed context window (tokens).
    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }

    /// Queue replies for `complete_prompt` (compaction summaries, judge
    /// verdicts).  When the queue is empty a canned summary is returned.
    pub fn with_prompt_replies(self, replies: Vec<String>) -> Self {
        *self.prompt_replies.lock().unwrap() = replies.into();
        self
    }

    /// Shared handle to the recorded requests.
    pub fn requests(&self) -> Arc<Mutex<Vec<CompletionRequest>>> {
        Arc::clone(&self.requests)
    }

    /// Number of `complete` calls made so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<CompletionResponse> {
        self.requests.lock().unwrap().push(req);
        let next = self.scripts.lock().unwrap().pop_front();
        match next {
            Some(resp) => {
                *self.last.lock().unwrap() = Some(resp.clone());
                Ok(resp)
            }
            None => match self.last.lock().unwrap().clone() {
                Some(resp) => Ok(resp),
                None => Ok(CompletionResponse::text("")),
            },
        }
    }

    async fn complete_prompt(&self, _prompt: &str) -> anyhow::Result<String> {
        let reply = self.prompt_replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or_else(|| "summary of earlier conversation".to_string()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
