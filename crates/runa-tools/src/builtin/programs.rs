// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use runa_session::StopSignal;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

/// Tail length shown per stream in job listings.
const STATUS_TAIL_LINES: usize = 40;

fn job_id_arg(call: &ToolCall) -> Result<u64, String> {
    call.args
        .get("id")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| "missing required parameter 'id'".to_string())
}

fn render_status(st: &runa_session::JobStatus) -> String {
    let mut out = format!(
        "[job {}] {} — {}",
        st.id,
        st.command,
        if st.completed {
            match st.exit_code {
                Some(code) => format!("exited {code}"),
                None => "killed by signal".to_string(),
            }
        } else {
            "running".to_string()
        }
    );
    let tail = |lines: &[String]| -> String {
        let start = lines.len().saturating_sub(STATUS_TAIL_LINES);
        lines[start..].join("\n")
    };
    if !st.stdout.is_empty() {
        out.push_str(&format!("\n[stdout]\n{}", tail(&st.stdout)));
    }
    if !st.stderr.is_empty() {
        out.push_str(&format!("\n[stderr]\n{}", tail(&st.stderr)));
    }
    out
}

// ─── status_program ───────────────────────────────────────────────────────────

/// Lists background jobs, or one job's status and output tail.
pub struct StatusProgramTool;

#[async_trait]
impl Tool for StatusProgramTool {
    fn name(&self) -> &str {
        "status_program"
    }

    fn description(&self) -> &str {
        "Show background jobs. With 'id', show that job's state and the tail \
         of its output; without, list all jobs of this session."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer", "description": "Job id (optional)" }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        if let Some(id) = call.args.get("id").and_then(|v| v.as_u64()) {
            return match ctx.session.job(id) {
                Some(job) => ToolOutput::ok(&call.id, render_status(&job.status())),
                None => ToolOutput::err(&call.id, format!("no background job with id {id}")),
            };
        }
        let jobs = ctx.session.jobs();
        if jobs.is_empty() {
            return ToolOutput::ok(&call.id, "no background jobs");
        }
        let listing = jobs
            .iter()
            .map(|j| {
                let st = j.status();
                format!(
                    "[job {}] {} — {}",
                    st.id,
                    st.command,
                    if st.completed { "completed" } else { "running" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        ToolOutput::ok(&call.id, listing)
    }
}

// ─── wait_program ─────────────────────────────────────────────────────────────

/// Blocks until a background job completes (or the iteration is cancelled).
pub struct WaitProgramTool;

#[async_trait]
impl Tool for WaitProgramTool {
    fn name(&self) -> &str {
        "wait_program"
    }

    fn description(&self) -> &str {
        "Wait for a background job to finish, then return its status and \
         output tail."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer", "description": "Job id to wait for" }
            },
            "required": ["id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let id = match job_id_arg(call) {
            Ok(id) => id,
            Err(e) => return ToolOutput::err(&call.id, e),
        };
        let Some(job) = ctx.session.job(id) else {
            return ToolOutput::err(&call.id, format!("no background job with id {id}"));
        };
        if job.wait(&ctx.cancel).await {
            ToolOutput::ok(&call.id, render_status(&job.status()))
        } else {
            ToolOutput::err(&call.id, format!("wait for job {id} was cancelled"))
        }
    }
}

// ─── stop_program ─────────────────────────────────────────────────────────────

/// Delivers SIGTERM or SIGKILL to a background job.
pub struct StopProgramTool;

#[async_trait]
impl Tool for StopProgramTool {
    fn name(&self) -> &str {
        "stop_program"
    }

    fn description(&self) -> &str {
        "Stop a background job. signal: 'term' (default, graceful) or 'kill'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer", "description": "Job id to stop" },
                "signal": {
                    "type": "string",
                    "enum": ["term", "kill"],
                    "description": "Signal to deliver (default 'term')"
                }
            },
            "required": ["id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let id = match job_id_arg(call) {
            Ok(id) => id,
            Err(e) => return ToolOutput::err(&call.id, e),
        };
        let Some(job) = ctx.session.job(id) else {
            return ToolOutput::err(&call.id, format!("no background job with id {id}"));
        };
        let signal = match call.args.get("signal").and_then(|v| v.as_str()) {
            Some("kill") => StopSignal::Kill,
            Some("term") | None => StopSignal::Term,
            Some(other) => {
                return ToolOutput::err(&call.id, format!("unknown signal: {other}"));
            }
        };
        if job.completed() {
            return ToolOutput::ok(&call.id, format!("job {id} had already completed"));
        }
        job.stop(signal);
        ToolOutput::ok(&call.id, format!("sent {signal:?} to job {id}"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
