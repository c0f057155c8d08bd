// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use runa_model::ToolCallRecord;
use runa_session::{Authorizer, Session, UserInteraction};

/// A single tool invocation with parsed arguments.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

impl ToolCall {
    /// Parse the serialized argument blob of a [`ToolCallRecord`].
    ///
    /// A malformed blob is reported as `Err(description)` so the caller can
    /// hand the problem back to the model as a tool-role error message.
    pub fn from_record(record: &ToolCallRecord) -> Result<Self, String> {
        let args: Value = if record.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&record.arguments) {
                Ok(v @ Value::Object(_)) => v,
                Ok(other) => {
                    return Err(format!(
                        "tool arguments must be a JSON object, got: {other}"
                    ))
                }
                Err(e) => return Err(format!("malformed JSON tool arguments: {e}")),
            }
        };
        Ok(Self {
            id: record.id.clone(),
            name: record.name.clone(),
            args,
        })
    }
}

/// Capabilities handed to a tool for one execution.
///
/// Everything is a non-owning shared handle; tools never own the session or
/// the authorizer, they only act through them.
#[derive(Clone)]
pub struct ToolContext {
    pub session: Arc<Session>,
    pub authorizer: Arc<Authorizer>,
    pub ui: Arc<dyn UserInteraction>,
    /// Cancellation for the surrounding iteration; long-running tools must
    /// observe it.
    pub cancel: CancellationToken,
    /// Serializes user prompts within one tool-call batch so concurrent
    /// `ask_user` calls never race at the terminal.
    pub ask_lock: Arc<tokio::sync::Mutex<()>>,
    /// Optional status callback for long-running tools (ephemeral text).
    pub status: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl ToolContext {
    pub fn new(
        session: Arc<Session>,
        authorizer: Arc<Authorizer>,
        ui: Arc<dyn UserInteraction>,
    ) -> Self {
        Self {
            session,
            authorizer,
            ui,
            cancel: CancellationToken::new(),
            ask_lock: Arc::new(tokio::sync::Mutex::new(())),
            status: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_status(mut self, status: Arc<dyn Fn(String) + Send + Sync>) -> Self {
        self.status = Some(status);
        self
    }

    /// Emit an ephemeral status line if a callback is attached.
    pub fn report_status(&self, message: impl Into<String>) {
        if let Some(status) = &self.status {
            status(message.into());
        }
    }
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    /// Plain-text content: the value on success, the message otherwise.
    pub content: String,
    /// True when the tool failed non-fatally (the message goes back to the
    /// model, the loop continues).
    pub is_error: bool,
    /// True when the action needs an interactive approval that could not be
    /// obtained; `content` carries the reason.
    pub requires_input: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            requires_input: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
            requires_input: false,
        }
    }

    pub fn needs_input(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: reason.into(),
            is_error: true,
            requires_input: true,
        }
    }
}

/// Trait every built-in and user-defined tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Execute the tool.  Errors are wrapped in [`ToolOutput::err`].
    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(args: &str) -> ToolCallRecord {
        ToolCallRecord {
            id: "c1".into(),
            name: "read_file".into(),
            arguments: args.into(),
        }
    }

    #[test]
    fn from_record_parses_object_arguments() {
        let call = ToolCall::from_record(&record("{\"path\":\"a.txt\"}")).unwrap();
        assert_eq!(call.id, "c1");
        assert_eq!(call.args["path"], "a.txt");
    }

    #[test]
    fn from_record_treats_empty_blob_as_empty_object() {
        let call = ToolCall::from_record(&record("")).unwrap();
        assert!(call.args.as_object().unwrap().is_empty());
    }

    #[test]
    fn from_record_rejects_malformed_json() {
        let err = ToolCall::from_record(&record("{not json")).unwrap_err();
        assert!(err.contains("malformed JSON"));
    }

    #[test]
    fn from_record_rejects_non_object_arguments() {
        let err = ToolCall::from_record(&record("[1,2]")).unwrap_err();
        assert!(err.contains("JSON object"));
    }

    #[test]
    fn output_constructors_set_flags() {
        assert!(!ToolOutput::ok("1", "x").is_error);
        assert!(ToolOutput::err("1", "x").is_error);
        let ni = ToolOutput::needs_input("1", "approve me");
        assert!(ni.is_error);
        assert!(ni.requires_input);
    }
}
