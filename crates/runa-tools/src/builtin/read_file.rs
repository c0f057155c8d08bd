// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

/// Hard cap on lines returned by one call.
const DEFAULT_LINE_CAP: usize = 2_000;

/// Reads a line range from a file and registers the read in the session.
///
/// Reading is what unlocks later mutation of the same path — every write,
/// move, or delete checks the session read-set this tool populates.
pub struct ReadFileTool {
    pub line_cap: usize,
}

impl Default for ReadFileTool {
    fn default() -> Self {
        Self {
            line_cap: DEFAULT_LINE_CAP,
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a range of lines from a file. Lines are returned as `[n] content` \
         (1-indexed). from_line/to_line are optional; at most 2000 lines per call. \
         Reading a file is required before writing, moving or deleting it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the session root"
                },
                "from_line": {
                    "type": "integer",
                    "description": "First line to read, 1-indexed (default 1; 0 means unset)"
                },
                "to_line": {
                    "type": "integer",
                    "description": "Last line to read inclusive (default: from_line + 1999)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(path) = call.args.get("path").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required parameter 'path'");
        };
        let from = call
            .args
            .get("from_line")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let to = call.args.get("to_line").and_then(|v| v.as_u64()).unwrap_or(0) as usize;

        let resolved = match ctx.session.resolve_path(path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };

        debug!(path = %resolved.display(), from, to, "read_file tool");

        let content = match tokio::fs::read_to_string(&resolved).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {path}: {e}")),
        };

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();

        // 0 means "unset": start at line 1, end at the cap.
        let from = if from == 0 { 1 } else { from };
        let to = if to == 0 {
            (from + self.line_cap - 1).min(total.max(1))
        } else {
            to
        };

        if total == 0 {
            ctx.session.track_file_read(resolved, content);
            return ToolOutput::ok(&call.id, "[file is empty]");
        }
        if from > total {
            return ToolOutput::err(
                &call.id,
                format!("from_line {from} is beyond the end of the file ({total} lines)"),
            );
        }
        if to < from {
            return ToolOutput::err(&call.id, format!("to_line {to} is before from_line {from}"));
        }
        if to - from + 1 > self.line_cap {
            return ToolOutput::err(
                &call.id,
                format!(
                    "requested range spans {} lines; at most {} per call",
                    to - from + 1,
                    self.line_cap
                ),
            );
        }

        // Register the full observed content, not just the returned window.
        ctx.session.track_file_read(resolved, content.clone());

        // to beyond the end is clamped without error.
        let end = to.min(total);
        let body = lines[from - 1..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("[{}] {}", from + i, line))
            .collect::<Vec<_>>()
            .join("\n");

        ToolOutput::ok(&call.id, body)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
