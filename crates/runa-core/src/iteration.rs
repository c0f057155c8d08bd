// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use runa_config::RetryConfig;
use runa_model::{
    complete_with_retry, normalize_tool_call_ids, CompletionRequest, Message, ModelProvider,
    RateLimitGate,
};
use runa_session::Session;
use runa_tools::{ToolCall, ToolContext, ToolOutput, ToolRegistry};

use crate::context::ContextManager;
use crate::detector::LoopDetector;
use crate::events::{report, ProgressSink, ProgressUpdate};
use crate::outcome::IterationOutcome;

/// Executes one turn: compaction check, model call (shaped and retried),
/// repetition check, session append, and concurrent tool fan-out.
pub struct IterationExecutor {
    session: Arc<Session>,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn ModelProvider>,
    gate: Arc<RateLimitGate>,
    retry: RetryConfig,
    detector: Mutex<LoopDetector>,
    context_manager: OnceLock<Arc<ContextManager>>,
    tool_ctx: ToolContext,
    /// System prompt; byte-identical across every iteration of a run so the
    /// provider's prompt cache stays warm.
    system_prompt: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    caching_enabled: bool,
    cache_ttl: Option<String>,
}

impl IterationExecutor {
    pub fn new(
        session: Arc<Session>,
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn ModelProvider>,
        gate: Arc<RateLimitGate>,
        retry: RetryConfig,
        tool_ctx: ToolContext,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            session,
            registry,
            provider,
            gate,
            retry,
            detector: Mutex::new(LoopDetector::default()),
            context_manager: OnceLock::new(),
            tool_ctx,
            system_prompt: system_prompt.into(),
            temperature: None,
            max_tokens: None,
            caching_enabled: true,
            cache_ttl: None,
        }
    }

    pub fn with_sampling(mut self, temperature: Option<f32>, max_tokens: Option<u32>) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_caching(mut self, enabled: bool, ttl: Option<String>) -> Self {
        self.caching_enabled = enabled;
        self.cache_ttl = ttl;
        self
    }

    pub fn with_detector(self, detector: LoopDetector) -> Self {
        *self.detector.lock().unwrap_or_else(|e| e.into_inner()) = detector;
        self
    }

    /// Install the context manager.  Set-once: later calls are ignored and
    /// return `false`.
    pub fn set_context_manager(&self, cm: Arc<ContextManager>) -> bool {
        self.context_manager.set(cm).is_ok()
    }

    pub fn context_manager(&self) -> Option<&Arc<ContextManager>> {
        self.context_manager.get()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        &self.provider
    }

    /// Reset the repetition detector (a new run on a reused executor).
    pub fn reset_detector(&self) {
        self.detector.lock().unwrap_or_else(|e| e.into_inner()).reset();
    }

    /// Run one iteration.
    pub async fn run_iteration(
        &self,
        cancel: &CancellationToken,
        progress: &Option<ProgressSink>,
    ) -> IterationOutcome {
        let messages = self.session.snapshot();

        // Compaction gate before the request is built.
        if let Some(cm) = self.context_manager.get() {
            if cm.should_compact(
                self.provider.context_window(),
                &self.system_prompt,
                &messages,
            ) {
                debug!("context near limit; requesting compaction");
                return IterationOutcome::compaction_needed();
            }
        }

        let (estimated_tokens, _) = ContextManager::estimate(&self.system_prompt, &messages);
        let request = CompletionRequest {
            messages,
            tools: self.registry.schemas(),
            system_prompt: self.system_prompt.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            caching_enabled: self.caching_enabled,
            cache_ttl: self.cache_ttl.clone(),
        };

        report(
            progress,
            ProgressUpdate::status(format!("waiting for {}", self.provider.model_name())),
        );
        if let Err(e) = self.gate.acquire(estimated_tokens, cancel).await {
            return IterationOutcome::failed(e.to_string());
        }

        let response =
            match complete_with_retry(self.provider.as_ref(), &request, &self.retry, cancel).await
            {
                Ok(r) => r,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return IterationOutcome::failed("completion cancelled");
                    }
                    return IterationOutcome::failed(format!("{e:#}"));
                }
            };

        let calls = normalize_tool_call_ids(response.tool_calls);

        // Repetition check runs before the message is committed; a flagged
        // turn ends the run without executing its tool calls.
        let detection = self
            .detector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add(&response.content);
        if detection.is_loop {
            warn!(count = detection.count, "repetitive output detected");
            return IterationOutcome::loop_detected(detection.pattern, detection.count);
        }

        self.session.push(Message::assistant_with_calls(
            response.content.clone(),
            response.reasoning.clone(),
            calls.clone(),
        ));

        if calls.is_empty() {
            if !response.content.is_empty() {
                report(progress, ProgressUpdate::transcript(response.content.clone()));
            }
            return IterationOutcome::finished(response.content, response.reasoning);
        }

        // Fan out tool calls concurrently; results are collected back in
        // input order so the appended history is deterministic.
        let mut ctx = self.tool_ctx.clone().with_cancel(cancel.clone());
        if let Some(sink) = progress {
            let sink = Arc::clone(sink);
            ctx = ctx.with_status(Arc::new(move |s: String| {
                sink(ProgressUpdate::status(s));
            }));
        }
        enum Pending {
            Task(tokio::task::JoinHandle<ToolOutput>),
            Ready(ToolOutput),
        }
        let mut pending = Vec::with_capacity(calls.len());
        for record in &calls {
            report(
                progress,
                ProgressUpdate::status(format!("running {}", record.name)),
            );
            match ToolCall::from_record(record) {
                Ok(call) => {
                    let registry = Arc::clone(&self.registry);
                    let ctx = ctx.clone();
                    pending.push(Pending::Task(tokio::spawn(async move {
                        registry.execute(&ctx, &call).await
                    })));
                }
                // Malformed arguments go back to the model as a tool error.
                Err(msg) => pending.push(Pending::Ready(ToolOutput::err(&record.id, msg))),
            }
        }

        let mut outputs: Vec<ToolOutput> = Vec::with_capacity(pending.len());
        for (i, p) in pending.into_iter().enumerate() {
            let output = match p {
                Pending::Ready(out) => out,
                Pending::Task(handle) => match handle.await {
                    Ok(out) => out,
                    Err(e) => ToolOutput::err(&calls[i].id, format!("tool task panicked: {e}")),
                },
            };
            outputs.push(output);
        }

        for (record, output) in calls.iter().zip(outputs.iter()) {
            let content = if output.requires_input {
                format!("[authorization required] {}", output.content)
            } else if output.is_error {
                format!("[error] {}", output.content)
            } else {
                output.content.clone()
            };
            self.session
                .push(Message::tool_result(&record.id, &record.name, content));
        }

        IterationOutcome::proceed(response.content, response.reasoning, calls)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
