// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use runa_session::BackgroundJob;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Lines kept from the head / tail of oversized output.  Errors and
/// summaries cluster at the end of build output, so the tail matters as much
/// as the head.
const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

/// Runs a shell command, foreground with a timeout or detached as a
/// background job.
pub struct ShellTool {
    pub timeout_secs: u64,
    pub timeout_max_secs: u64,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            timeout_max_secs: 3_600,
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr with the exit code.\n\
         Foreground runs are bounded by a timeout (default 30 s, max 3600 s).\n\
         Set background=true (or end the command with '&') to launch a detached\n\
         job instead; the job id is returned for status_program / wait_program /\n\
         stop_program. Output is capped; when larger, the first and last 100\n\
         lines are preserved with an omission marker in the middle."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash one-liner to execute"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory relative to the session root (optional)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Foreground timeout in seconds (optional)"
                },
                "background": {
                    "type": "boolean",
                    "description": "Launch as a detached background job (default false)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(raw_command) = call.args.get("command").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required parameter 'command'");
        };
        let workdir = match call.args.get("workdir").and_then(|v| v.as_str()) {
            Some(wd) => match ctx.session.resolve_path(wd) {
                Ok(p) => p,
                Err(e) => return ToolOutput::err(&call.id, e.to_string()),
            },
            None => ctx.session.root().to_path_buf(),
        };
        let timeout = call
            .args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.timeout_secs)
            .min(self.timeout_max_secs);

        // A trailing '&' is the shell idiom for backgrounding; honour it the
        // same as the explicit flag.
        let trimmed = raw_command.trim();
        let wants_background = call
            .args
            .get("background")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
            || trimmed.ends_with('&');
        let command = trimmed.trim_end_matches('&').trim_end().to_string();
        if command.is_empty() {
            return ToolOutput::err(&call.id, "empty command");
        }

        debug!(cmd = %command, background = wants_background, "shell tool");

        if wants_background {
            let id = ctx.session.next_job_id();
            return match BackgroundJob::launch(id, &command, &workdir) {
                Ok(job) => {
                    let pid = job.pid().unwrap_or(0);
                    ctx.session.register_job(job);
                    ToolOutput::ok(
                        &call.id,
                        format!("[job {id}] started (pid {pid}): {command}"),
                    )
                }
                Err(e) => ToolOutput::err(&call.id, format!("spawn error: {e}")),
            };
        }

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        // New session: the child cannot reach the controlling terminal.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let run = tokio::time::timeout(Duration::from_secs(timeout), cmd.output());
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return ToolOutput::err(&call.id, "command cancelled");
            }
            r = run => r,
        };

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stdout.is_empty() {
                    content.push_str(&head_tail_truncate(&stdout));
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&head_tail_truncate(&stderr));
                }

                let code = output.status.code().unwrap_or(-1);
                if content.is_empty() {
                    content = format!("[exit {code}]");
                } else {
                    content = format!("{content}\n[exit {code}]");
                }
                if code == 0 || code == 1 {
                    // Exit 1 is "no matches" (grep) or "condition false"
                    // (test) — flagging it as an error misleads the model.
                    ToolOutput::ok(&call.id, content)
                } else {
                    ToolOutput::err(&call.id, content)
                }
            }
            Ok(Err(e)) => ToolOutput::err(&call.id, format!("spawn error: {e}")),
            Err(_) => ToolOutput::err(&call.id, format!("[timeout] command exceeded {timeout}s")),
        }
    }
}

/// Truncate `s` to fit within `OUTPUT_LIMIT_BYTES`, keeping the head and
/// tail with an omission marker in between.
pub(crate) fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }

    let lines: Vec<&str> = s.lines().collect();
    let total = lines.len();

    if total <= HEAD_LINES + TAIL_LINES {
        // Byte budget exceeded by very long lines; fall back to byte windows.
        let head = &s[..OUTPUT_LIMIT_BYTES / 2];
        let tail = &s[s.len() - OUTPUT_LIMIT_BYTES / 2..];
        let omitted = s.len() - head.len() - tail.len();
        return format!("{head}\n...[{omitted} bytes omitted]...\n{tail}");
    }

    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[total - TAIL_LINES..].join("\n");
    let omitted_lines = total - HEAD_LINES - TAIL_LINES;
    let omitted_bytes = s.len().saturating_sub(head.len() + tail.len());
    format!("{head}\n...[{omitted_lines} lines / ~{omitted_bytes} bytes omitted]...\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use runa_session::{Authorizer, ScriptedInteraction, Session};

    fn ctx_in(dir: &std::path::Path) -> ToolContext {
        let session = Arc::new(Session::new(dir));
        let ui = Arc::new(ScriptedInteraction::new(vec![]));
        let auth = Arc::new(Authorizer::new(Arc::clone(&session), ui.clone()));
        ToolContext::new(session, auth, ui)
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "shell".into(),
            args,
        }
    }

    // ── Foreground ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn echo_returns_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellTool::default()
            .execute(&ctx_in(dir.path()), &call(json!({"command": "echo hello"})))
            .await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("hello"));
        assert!(out.content.contains("[exit 0]"));
    }

    #[tokio::test]
    async fn stderr_is_labelled() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellTool::default()
            .execute(
                &ctx_in(dir.path()),
                &call(json!({"command": "echo out && echo err >&2"})),
            )
            .await;
        assert!(out.content.contains("out"));
        assert!(out.content.contains("[stderr]"));
        assert!(out.content.contains("err"));
    }

    #[tokio::test]
    async fn exit_1_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellTool::default()
            .execute(&ctx_in(dir.path()), &call(json!({"command": "exit 1"})))
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("[exit 1]"));
    }

    #[tokio::test]
    async fn exit_2_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellTool::default()
            .execute(&ctx_in(dir.path()), &call(json!({"command": "exit 2"})))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("[exit 2]"));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ShellTool {
            timeout_secs: 1,
            timeout_max_secs: 3_600,
        };
        let out = tool
            .execute(
                &ctx_in(dir.path()),
                &call(json!({"command": "sleep 30", "timeout_secs": 1})),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("[timeout]"));
    }

    #[tokio::test]
    async fn requested_timeout_is_clamped_to_max() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ShellTool {
            timeout_secs: 30,
            timeout_max_secs: 1,
        };
        let out = tool
            .execute(
                &ctx_in(dir.path()),
                &call(json!({"command": "sleep 10", "timeout_secs": 9999})),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("exceeded 1s"));
    }

    #[tokio::test]
    async fn workdir_changes_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let out = ShellTool::default()
            .execute(
                &ctx_in(dir.path()),
                &call(json!({"command": "pwd", "workdir": "sub"})),
            )
            .await;
        assert!(out.content.contains("sub"));
    }

    #[tokio::test]
    async fn missing_command_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellTool::default()
            .execute(&ctx_in(dir.path()), &call(json!({})))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("command"));
    }

    // ── Background ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn background_flag_registers_job() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        let out = ShellTool::default()
            .execute(
                &ctx,
                &call(json!({"command": "sleep 5", "background": true})),
            )
            .await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("[job 1] started"));
        let job = ctx.session.job(1).unwrap();
        assert!(!job.completed());
        job.kill();
    }

    #[tokio::test]
    async fn trailing_ampersand_backgrounds_too() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        let out = ShellTool::default()
            .execute(&ctx, &call(json!({"command": "sleep 5 &"})))
            .await;
        assert!(out.content.contains("started"));
        assert_eq!(ctx.session.jobs().len(), 1);
        ctx.session.job(1).unwrap().kill();
    }

    // ── Truncation ────────────────────────────────────────────────────────────

    #[test]
    fn short_output_passes_through() {
        assert_eq!(head_tail_truncate("a\nb\n"), "a\nb\n");
    }

    #[test]
    fn head_and_tail_are_preserved_with_marker() {
        let mut lines = vec!["FIRST".to_string()];
        for i in 0..900 {
            lines.push(format!("middle {i} padding padding padding padding"));
        }
        lines.push("LAST".to_string());
        let content = lines.join("\n");
        let out = head_tail_truncate(&content);
        assert!(out.contains("FIRST"));
        assert!(out.contains("LAST"));
        assert!(out.contains("omitted"));
        assert!(out.len() < content.len());
    }
}
