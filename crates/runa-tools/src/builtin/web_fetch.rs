// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

/// Byte cap on fetched bodies returned to the model.
const BODY_LIMIT_BYTES: usize = 100_000;

/// Fetch a URL over HTTP(S).  The target domain is gated by the authorizer
/// before the request leaves the process (the registry performs that check
/// for this tool by name).
pub struct WebFetchTool {
    client: reqwest::Client,
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL with GET and return the response body as text (capped at \
         ~100 KB). The domain must be approved; approval is requested on first \
         use and remembered for the session."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Absolute http(s) URL to fetch"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(url) = call.args.get("url").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required parameter 'url'");
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolOutput::err(&call.id, format!("unsupported URL scheme: {url}"));
        }

        debug!(url, "web_fetch tool");

        let resp = tokio::select! {
            _ = ctx.cancel.cancelled() => return ToolOutput::err(&call.id, "fetch cancelled"),
            r = self.client.get(url).send() => r,
        };
        match resp {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                let truncated = body.len() > BODY_LIMIT_BYTES;
                let mut shown: String = body.chars().take(BODY_LIMIT_BYTES).collect();
                if truncated {
                    shown.push_str("\n[body truncated]");
                }
                ToolOutput::ok(&call.id, format!("[status {status}]\n{shown}"))
            }
            Err(e) => ToolOutput::err(&call.id, format!("fetch error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
