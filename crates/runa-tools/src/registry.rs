// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tracing::debug;

use runa_model::ToolSchema;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

/// Central registry holding all available tools.
///
/// Dispatch by name is the one dynamic-dispatch site of the runtime; the map
/// sits behind a reader-preference lock so registration and reset can happen
/// while reads dominate.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) {
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool.name().to_string(), tool);
    }

    /// Remove every registered tool.
    pub fn reset(&self) {
        self.tools.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// A new registry holding only the named tools (missing names ignored).
    pub fn subset(&self, names: &[&str]) -> ToolRegistry {
        let out = ToolRegistry::new();
        for name in names {
            if let Some(tool) = self.get(name) {
                out.register_arc(tool);
            }
        }
        out
    }

    /// Schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// The `{"type":"function","function":{…}}` envelopes the completion
    /// request carries.
    pub fn envelopes(&self) -> Vec<Value> {
        self.schemas()
            .into_iter()
            .map(|s| {
                json!({
                    "type": "function",
                    "function": {
                        "name": s.name,
                        "description": s.description,
                        "parameters": s.parameters
                    }
                })
            })
            .collect()
    }

    /// Authorize and execute one call.
    ///
    /// Every execution passes through the authorizer first; a denial or a
    /// pending-approval outcome is returned without running the tool.
    pub async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(tool) = self.get(&call.name) else {
            return ToolOutput::err(&call.id, format!("unknown tool: {}", call.name));
        };

        let decision = ctx.authorizer.authorize(&call.name, &call.args).await;
        if !decision.allowed {
            debug!(tool = %call.name, reason = %decision.reason, "tool call not authorized");
            return if decision.requires_user_input {
                ToolOutput::needs_input(&call.id, decision.reason)
            } else {
                ToolOutput::err(&call.id, decision.reason)
            };
        }

        debug!(tool = %call.name, id = %call.id, "executing tool");
        tool.execute(ctx, call).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use runa_session::{Authorizer, ScriptedInteraction, Session};

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    fn ctx() -> ToolContext {
        let session = Arc::new(Session::new("/tmp/runa_registry_test"));
        let ui = Arc::new(ScriptedInteraction::new(vec![]));
        let auth = Arc::new(Authorizer::new(Arc::clone(&session), ui.clone()));
        ToolContext::new(session, auth, ui)
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: name.into(),
            args: json!({}),
        }
    }

    #[test]
    fn register_get_reset() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        assert!(reg.get("echo").is_some());
        reg.reset();
        assert!(reg.get("echo").is_none());
    }

    #[test]
    fn names_are_sorted() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "b" });
        reg.register(EchoTool { name: "a" });
        assert_eq!(reg.names(), vec!["a", "b"]);
    }

    #[test]
    fn subset_keeps_only_named_tools() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "keep" });
        reg.register(EchoTool { name: "drop" });
        let sub = reg.subset(&["keep", "missing"]);
        assert_eq!(sub.names(), vec!["keep"]);
    }

    #[test]
    fn envelopes_have_function_shape() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        let env = reg.envelopes();
        assert_eq!(env[0]["type"], "function");
        assert_eq!(env[0]["function"]["name"], "echo");
        assert_eq!(env[0]["function"]["description"], "echoes its input");
    }

    #[tokio::test]
    async fn execute_known_tool_succeeds() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        let out = reg.execute(&ctx(), &call("echo")).await;
        assert!(!out.is_error);
        assert!(out.content.starts_with("echo:"));
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_error() {
        let reg = ToolRegistry::new();
        let out = reg.execute(&ctx(), &call("missing")).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn unapproved_file_mutation_does_not_execute() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "write_file" });
        // No scripted answers: the mutation prompt fails, so the tool body
        // never runs.
        let out = reg
            .execute(
                &ctx(),
                &ToolCall {
                    id: "1".into(),
                    name: "write_file".into(),
                    args: json!({"path": "a.txt", "content": "x"}),
                },
            )
            .await;
        assert!(out.is_error);
        assert!(out.requires_input);
        assert!(!out.content.starts_with("echo:"));
    }

    #[tokio::test]
    async fn unauthorized_shell_call_does_not_execute() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "shell" });
        // Headless-style context: no scripted answers → prompt fails →
        // requires_input decision.
        let out = reg
            .execute(
                &ctx(),
                &ToolCall {
                    id: "1".into(),
                    name: "shell".into(),
                    args: json!({"command": "rm -rf /"}),
                },
            )
            .await;
        assert!(out.is_error);
        assert!(out.requires_input);
        assert!(!out.content.starts_with("echo:"));
    }
}
