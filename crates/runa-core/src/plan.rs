// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Shape of a planning answer: a flat step list or a task board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    Simple,
    Board,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// One task on a plan board; subtasks share the shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<PlanTask>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanBoard {
    #[serde(default)]
    pub primary_tasks: Vec<PlanTask>,
}

/// A planning answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub mode: PlanMode,
    /// Ordered step strings (simple mode).
    pub steps: Vec<String>,
    /// Task board (board mode).
    pub board: Option<PlanBoard>,
    /// The model's own claim of completeness.  A plan with content is
    /// returned to the caller regardless of this flag.
    pub complete: bool,
}

impl Plan {
    pub fn empty() -> Self {
        Self {
            mode: PlanMode::Simple,
            steps: Vec::new(),
            board: None,
            complete: false,
        }
    }

    pub fn simple(steps: Vec<String>) -> Self {
        Self {
            mode: PlanMode::Simple,
            steps,
            board: None,
            complete: true,
        }
    }

    pub fn board(board: PlanBoard) -> Self {
        Self {
            mode: PlanMode::Board,
            steps: Vec::new(),
            board: Some(board),
            complete: true,
        }
    }

    /// Any primary task or any step string counts as content, regardless of
    /// the `complete` flag.
    pub fn has_content(&self) -> bool {
        !self.steps.is_empty()
            || self
                .board
                .as_ref()
                .is_some_and(|b| !b.primary_tasks.is_empty())
    }
}

/// Render a plan as the `<answer>` envelope the model is asked to emit.
pub fn serialize_plan(plan: &Plan) -> String {
    let body = match plan.mode {
        PlanMode::Simple => json!({
            "mode": "simple",
            "plan": plan.steps,
            "complete": plan.complete,
        }),
        PlanMode::Board => json!({
            "mode": "board",
            "board": plan.board.clone().unwrap_or_default(),
            "complete": plan.complete,
        }),
    };
    format!("<answer>{body}</answer>")
}

/// Extract a plan from model output.
///
/// Looks for the last `<answer>…</answer>` envelope and parses its JSON.
/// The `mode` field is honoured when present; otherwise the mode is
/// inferred — a `board` object implies board, a `plan` array implies
/// simple.  Returns `None` when no parseable envelope exists.
pub fn extract_plan(text: &str) -> Option<Plan> {
    let start = text.rfind("<answer>")? + "<answer>".len();
    let end = text[start..].find("</answer>")? + start;
    let body: Value = serde_json::from_str(text[start..end].trim()).ok()?;

    let explicit_mode = match body.get("mode").and_then(|m| m.as_str()) {
        Some("simple") => Some(PlanMode::Simple),
        Some("board") => Some(PlanMode::Board),
        _ => None,
    };
    let mode = explicit_mode.or_else(|| {
        if body.get("board").is_some_and(|b| b.is_object()) {
            Some(PlanMode::Board)
        } else if body.get("plan").is_some_and(|p| p.is_array()) {
            Some(PlanMode::Simple)
        } else {
            None
        }
    })?;

    let steps: Vec<String> = body
        .get("plan")
        .and_then(|p| p.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let board: Option<PlanBoard> = body
        .get("board")
        .cloned()
        .and_then(|b| serde_json::from_value(b).ok());
    let complete = body
        .get("complete")
        .and_then(|c| c.as_bool())
        .unwrap_or(false);

    Some(Plan {
        mode,
        steps,
        board,
        complete,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
