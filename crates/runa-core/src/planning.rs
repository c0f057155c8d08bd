// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use runa_model::{Message, Role};

use crate::events::{report, ProgressSink, ProgressUpdate};
use crate::iteration::IterationExecutor;
use crate::outcome::{IterationOutcome, OutcomeKind};
use crate::plan::{extract_plan, Plan};
use crate::strategy::{LoopState, Strategy};

/// Context files larger than this are cut, with a visible marker line.
const MAX_CONTEXT_FILE_BYTES: usize = 50 * 1024;
const TRUNCATION_MARKER: &str = "[… truncated: context file exceeds 50 KiB …]";

/// What to plan and how much the planner may ask.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub objective: String,
    pub extra_context: Option<String>,
    /// Files dumped into the prompt prefix (and registered as read).
    pub context_files: Vec<PathBuf>,
    /// How many user questions the planner may spend.
    pub max_questions: usize,
}

impl PlanRequest {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            extra_context: None,
            context_files: Vec::new(),
            max_questions: 5,
        }
    }
}

/// Outcome of one planning run.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Plan,
    /// True when the plan is partial because the question budget ran out or
    /// a question could not be answered.
    pub needs_input: bool,
    pub iterations_executed: u32,
    pub termination_reason: String,
}

/// A specialization of the orchestrator loop that produces plan artifacts.
///
/// The executor behind it is expected to carry the planning tool subset and
/// the planning system prompt; iteration bounds are tighter than the main
/// loop's.
pub struct PlanningLoop {
    executor: Arc<IterationExecutor>,
    strategy: Arc<dyn Strategy>,
    max_iterations: u32,
    progress: Option<ProgressSink>,
}

impl PlanningLoop {
    pub fn new(
        executor: Arc<IterationExecutor>,
        strategy: Arc<dyn Strategy>,
        max_iterations: u32,
    ) -> Self {
        Self {
            executor,
            strategy,
            max_iterations,
            progress: None,
        }
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn executor(&self) -> &Arc<IterationExecutor> {
        &self.executor
    }

    /// Build the prompt prefix and loop until a plan (or a reason to stop)
    /// emerges.
    pub async fn run(&self, request: &PlanRequest, cancel: &CancellationToken) -> PlanOutcome {
        // The prefix is built exactly once, before the first iteration, and
        // never rewritten: every later request shares these message handles,
        // which keeps the provider-side prompt cache warm for the whole run.
        if self.executor.session().is_empty() {
            self.build_prefix(request).await;
        }

        let mut state = LoopState {
            iteration: 0,
            max_iterations: self.max_iterations,
            auto_continue_attempts: 0,
            auto_continue_max: 0,
        };
        let mut last = IterationOutcome::finished(String::new(), None);
        let mut overflowed = false;

        loop {
            if cancel.is_cancelled() {
                return PlanOutcome {
                    plan: self.best_effort_plan(&last),
                    needs_input: true,
                    iterations_executed: state.iteration,
                    termination_reason: "terminated by external signal".into(),
                };
            }
            if state.iteration >= self.max_iterations {
                last = IterationOutcome {
                    kind: OutcomeKind::BreakMaxIterations,
                    ..last
                };
                break;
            }
            if self.questions_asked() > request.max_questions {
                warn!(
                    max_questions = request.max_questions,
                    "question budget exceeded; returning partial plan"
                );
                overflowed = true;
                break;
            }

            state.iteration += 1;
            report(
                &self.progress,
                ProgressUpdate::status(format!("planning iteration {}", state.iteration)),
            );
            let outcome = self.executor.run_iteration(cancel, &self.progress).await;
            let stop = !self.strategy.should_continue(&state, &outcome);
            last = outcome;
            if stop {
                break;
            }
        }

        // Stopping only because the counter ran out reports the iteration
        // limit, whichever branch noticed it first.
        if !overflowed
            && state.iteration >= self.max_iterations
            && matches!(
                last.kind,
                OutcomeKind::Continue | OutcomeKind::CompactionNeeded
            )
        {
            last = IterationOutcome {
                kind: OutcomeKind::BreakMaxIterations,
                ..last
            };
        }

        let plan = self.best_effort_plan(&last);
        let unanswered_question = self.has_unanswered_question();
        let needs_input = overflowed || unanswered_question || !plan.has_content();
        let termination_reason = if overflowed {
            "question budget exhausted".to_string()
        } else {
            match last.kind {
                OutcomeKind::Break => "completed normally".to_string(),
                OutcomeKind::BreakMaxIterations => "iteration limit reached".to_string(),
                OutcomeKind::BreakLoopDetected => "loop detected".to_string(),
                OutcomeKind::Error => last.error.clone().unwrap_or_else(|| "error".into()),
                _ => "stopped before completion".to_string(),
            }
        };
        debug!(
            iterations = state.iteration,
            needs_input, "planning loop finished"
        );
        PlanOutcome {
            plan,
            needs_input,
            iterations_executed: state.iteration,
            termination_reason,
        }
    }

    /// Objective → optional extra context → context-file dumps.
    async fn build_prefix(&self, request: &PlanRequest) {
        let session = self.executor.session();
        session.push(Message::user(request.objective.clone()));
        if let Some(context) = &request.extra_context {
            session.push(Message::user(format!("Additional context:\n{context}")));
        }
        for path in &request.context_files {
            let resolved = match session.resolve_path(&path.to_string_lossy()) {
                Ok(p) => p,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "context file skipped");
                    continue;
                }
            };
            let content = match tokio::fs::read_to_string(&resolved).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %resolved.display(), error = %e, "context file unreadable");
                    continue;
                }
            };
            session.track_file_read(resolved.clone(), content.clone());
            let dumped = if content.len() > MAX_CONTEXT_FILE_BYTES {
                let cut: String = content.chars().take(MAX_CONTEXT_FILE_BYTES).collect();
                format!("{cut}\n{TRUNCATION_MARKER}")
            } else {
                content
            };
            session.push(Message::user(format!(
                "Context file {}:\n```\n{dumped}\n```",
                path.display()
            )));
        }
    }

    /// Tool-role answers to ask_user / ask_user_multiple calls so far.
    fn questions_asked(&self) -> usize {
        self.executor
            .session()
            .snapshot()
            .iter()
            .filter(|m| {
                m.role == Role::Tool
                    && matches!(
                        m.tool_name.as_deref(),
                        Some("ask_user") | Some("ask_user_multiple")
                    )
            })
            .count()
    }

    /// True when some question tool reported that nobody could answer it.
    fn has_unanswered_question(&self) -> bool {
        self.executor.session().snapshot().iter().any(|m| {
            m.role == Role::Tool
                && matches!(
                    m.tool_name.as_deref(),
                    Some("ask_user") | Some("ask_user_multiple")
                )
                && m.content.contains("[authorization required]")
        })
    }

    /// The plan in the final content, or in the most recent assistant turn
    /// that carries an answer envelope.
    fn best_effort_plan(&self, last: &IterationOutcome) -> Plan {
        if let Some(plan) = extract_plan(&last.content) {
            return plan;
        }
        for m in self.executor.session().snapshot().iter().rev() {
            if m.role == Role::Assistant {
                if let Some(plan) = extract_plan(&m.content) {
                    return plan;
                }
            }
        }
        Plan::empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
