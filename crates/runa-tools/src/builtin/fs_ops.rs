// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

/// Shared read-before-write check.
///
/// Mutating an *existing* path requires that the same path was read earlier
/// in this session; a path that does not exist yet may be created freely.
/// Returns `Some(error)` when the rule blocks the mutation.
pub(crate) fn read_required(ctx: &ToolContext, path: &Path, verb: &str) -> Option<String> {
    if path.exists() && !ctx.session.was_read(path) {
        Some(format!(
            "read-required: {} was never read in this session; read it before you {verb} it",
            path.display()
        ))
    } else {
        None
    }
}

fn path_arg<'a>(call: &'a ToolCall, key: &str) -> Result<&'a str, String> {
    call.args
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing required parameter '{key}'"))
}

// ─── write_file ───────────────────────────────────────────────────────────────

/// Overwrite (or create) a file with the given content.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, replacing what is there. An existing file must \
         have been read with read_file first; a new file may be written directly."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Target file path" },
                "content": { "type": "string", "description": "Full new file content" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let path = match path_arg(call, "path") {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };
        let content = call
            .args
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let resolved = match ctx.session.resolve_path(path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };
        if let Some(e) = read_required(ctx, &resolved, "write") {
            return ToolOutput::err(&call.id, e);
        }

        debug!(path = %resolved.display(), bytes = content.len(), "write_file tool");
        if let Err(e) = tokio::fs::write(&resolved, content).await {
            return ToolOutput::err(&call.id, format!("write error: {e}"));
        }
        ctx.session.track_file_modified(resolved.clone());
        // The written content is the last-observed state; further writes to
        // the same path stay unlocked.
        ctx.session.track_file_read(resolved, content);
        ToolOutput::ok(&call.id, format!("wrote {} bytes to {path}", content.len()))
    }
}

// ─── create_file ──────────────────────────────────────────────────────────────

/// Create a new file; parent directories are created as needed.
pub struct CreateFileTool;

#[async_trait]
impl Tool for CreateFileTool {
    fn name(&self) -> &str {
        "create_file"
    }

    fn description(&self) -> &str {
        "Create a new file (parent directories included). Fails if the file \
         already exists — use write_file to replace an existing file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path of the file to create" },
                "content": { "type": "string", "description": "Initial content (default empty)" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let path = match path_arg(call, "path") {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };
        let content = call
            .args
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let resolved = match ctx.session.resolve_path(path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };
        if resolved.exists() {
            return ToolOutput::err(&call.id, format!("{path} already exists"));
        }
        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(&call.id, format!("mkdir error: {e}"));
            }
        }
        debug!(path = %resolved.display(), "create_file tool");
        if let Err(e) = tokio::fs::write(&resolved, content).await {
            return ToolOutput::err(&call.id, format!("create error: {e}"));
        }
        ctx.session.track_file_modified(resolved.clone());
        ctx.session.track_file_read(resolved, content);
        ToolOutput::ok(&call.id, format!("created {path}"))
    }
}

// ─── remove_file ──────────────────────────────────────────────────────────────

pub struct RemoveFileTool;

#[async_trait]
impl Tool for RemoveFileTool {
    fn name(&self) -> &str {
        "remove_file"
    }

    fn description(&self) -> &str {
        "Delete a file. The file must have been read with read_file first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path of the file to delete" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let path = match path_arg(call, "path") {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };
        let resolved = match ctx.session.resolve_path(path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };
        if !resolved.exists() {
            return ToolOutput::err(&call.id, format!("{path} does not exist"));
        }
        if let Some(e) = read_required(ctx, &resolved, "delete") {
            return ToolOutput::err(&call.id, e);
        }
        debug!(path = %resolved.display(), "remove_file tool");
        if let Err(e) = tokio::fs::remove_file(&resolved).await {
            return ToolOutput::err(&call.id, format!("remove error: {e}"));
        }
        ctx.session.track_file_modified(resolved);
        ToolOutput::ok(&call.id, format!("removed {path}"))
    }
}

// ─── mkdir ────────────────────────────────────────────────────────────────────

pub struct MkdirTool;

#[async_trait]
impl Tool for MkdirTool {
    fn name(&self) -> &str {
        "mkdir"
    }

    fn description(&self) -> &str {
        "Create a directory, including missing parents."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path to create" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let path = match path_arg(call, "path") {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };
        let resolved = match ctx.session.resolve_path(path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };
        if resolved.is_dir() {
            return ToolOutput::ok(&call.id, format!("{path} already exists"));
        }
        if let Err(e) = tokio::fs::create_dir_all(&resolved).await {
            return ToolOutput::err(&call.id, format!("mkdir error: {e}"));
        }
        ctx.session.track_file_modified(resolved);
        ToolOutput::ok(&call.id, format!("created directory {path}"))
    }
}

// ─── move ─────────────────────────────────────────────────────────────────────

pub struct MoveTool;

#[async_trait]
impl Tool for MoveTool {
    fn name(&self) -> &str {
        "move"
    }

    fn description(&self) -> &str {
        "Move or rename a file or directory. Moving a file requires a prior \
         read of the source; overwriting an existing destination requires a \
         prior read of the destination."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source": { "type": "string", "description": "Existing path" },
                "destination": { "type": "string", "description": "New path" }
            },
            "required": ["source", "destination"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let source = match path_arg(call, "source") {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };
        let destination = match path_arg(call, "destination") {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };

        let src = match ctx.session.resolve_path(source) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };
        let dst = match ctx.session.resolve_path(destination) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };

        if !src.exists() {
            return ToolOutput::err(&call.id, format!("{source} does not exist"));
        }
        if src.is_file() {
            if let Some(e) = read_required(ctx, &src, "move") {
                return ToolOutput::err(&call.id, e);
            }
        }
        if let Some(e) = read_required(ctx, &dst, "overwrite") {
            return ToolOutput::err(&call.id, e);
        }

        debug!(src = %src.display(), dst = %dst.display(), "move tool");
        if let Some(parent) = dst.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(&call.id, format!("mkdir error: {e}"));
            }
        }
        let carried = ctx.session.read_content(&src);
        if let Err(e) = tokio::fs::rename(&src, &dst).await {
            return ToolOutput::err(&call.id, format!("move error: {e}"));
        }
        ctx.session.track_file_modified(src);
        ctx.session.track_file_modified(dst.clone());
        // Carry the source's observed content over to the destination path.
        if let Some(content) = carried {
            ctx.session.track_file_read(dst, content);
        }
        ToolOutput::ok(&call.id, format!("moved {source} to {destination}"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
