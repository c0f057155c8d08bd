// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use runa_model::Message;

use crate::context::ContextManager;
use crate::events::{report, ProgressSink, ProgressUpdate};
use crate::iteration::IterationExecutor;
use crate::outcome::{IterationOutcome, OutcomeKind, RunResult};
use crate::strategy::{LoopState, Strategy};

/// Nudge appended when a truncated-looking answer is auto-continued.
const AUTO_CONTINUE_NUDGE: &str =
    "Continue exactly where you left off. Do not repeat earlier output.";

/// Drives the iteration executor under a strategy until termination.
///
/// Single-flight per session: one orchestrator run owns its session for the
/// duration of the run.
pub struct Orchestrator {
    executor: Arc<IterationExecutor>,
    strategy: Arc<dyn Strategy>,
    max_iterations: u32,
    auto_continue_max: u32,
    progress: Option<ProgressSink>,
}

impl Orchestrator {
    pub fn new(
        executor: Arc<IterationExecutor>,
        strategy: Arc<dyn Strategy>,
        max_iterations: u32,
        auto_continue_max: u32,
    ) -> Self {
        Self {
            executor,
            strategy,
            max_iterations,
            auto_continue_max,
            progress: None,
        }
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Install the context manager on the underlying executor.  Set-once;
    /// returns `false` when one is already installed.
    pub fn set_context_manager(&self, cm: Arc<ContextManager>) -> bool {
        self.executor.set_context_manager(cm)
    }

    pub fn executor(&self) -> &Arc<IterationExecutor> {
        &self.executor
    }

    /// Run to termination.
    pub async fn run(&self, cancel: &CancellationToken) -> RunResult {
        let max_iterations = self.strategy.effective_max_iterations(self.max_iterations);
        let auto_continue_max = self
            .strategy
            .effective_auto_continue_max(self.auto_continue_max);
        let mut state = LoopState {
            iteration: 0,
            max_iterations,
            auto_continue_attempts: 0,
            auto_continue_max,
        };
        let mut last = IterationOutcome::finished(String::new(), None);
        let mut terminated_early = false;

        loop {
            if cancel.is_cancelled() {
                terminated_early = true;
                break;
            }
            if state.iteration >= max_iterations {
                last = IterationOutcome {
                    kind: OutcomeKind::BreakMaxIterations,
                    ..last
                };
                break;
            }

            // Bumped exactly once per iteration, before executing it.
            state.iteration += 1;
            report(
                &self.progress,
                ProgressUpdate::status(format!(
                    "iteration {}/{}",
                    state.iteration, max_iterations
                )),
            );

            let outcome = self.executor.run_iteration(cancel, &self.progress).await;

            match outcome.kind {
                OutcomeKind::CompactionNeeded => {
                    if let Some(cm) = self.executor.context_manager() {
                        report(&self.progress, ProgressUpdate::status("compacting context"));
                        match cm.compact(self.executor.session()).await {
                            Ok(true) => debug!("context compacted"),
                            Ok(false) => debug!("nothing to compact"),
                            Err(e) => warn!(error = %e, "compaction failed"),
                        }
                    } else {
                        warn!("compaction requested but no context manager is installed");
                    }
                    last = outcome;
                    if self.strategy.should_continue(&state, &last) {
                        continue;
                    }
                    break;
                }
                OutcomeKind::Break => {
                    let wants_more = state.auto_continue_attempts < auto_continue_max
                        && self
                            .strategy
                            .should_auto_continue(
                                &state,
                                self.executor.session(),
                                &outcome.content,
                            )
                            .await;
                    if wants_more {
                        state.auto_continue_attempts += 1;
                        debug!(
                            attempt = state.auto_continue_attempts,
                            "auto-continuing truncated answer"
                        );
                        self.executor.session().push(Message::user(AUTO_CONTINUE_NUDGE));
                        last = IterationOutcome {
                            kind: OutcomeKind::BreakAutoContinue,
                            ..outcome
                        };
                        if self.strategy.should_continue(&state, &last) {
                            continue;
                        }
                    } else {
                        last = outcome;
                    }
                    break;
                }
                OutcomeKind::Continue => {
                    last = outcome;
                    if self.strategy.should_continue(&state, &last) {
                        continue;
                    }
                    break;
                }
                OutcomeKind::Error
                | OutcomeKind::BreakLoopDetected
                | OutcomeKind::BreakAutoContinue
                | OutcomeKind::BreakMaxIterations => {
                    last = outcome;
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            terminated_early = true;
        }
        // A run that stopped only because the counter ran out reports the
        // iteration limit, whichever branch noticed it first.
        if !terminated_early
            && state.iteration >= max_iterations
            && matches!(
                last.kind,
                OutcomeKind::Continue
                    | OutcomeKind::CompactionNeeded
                    | OutcomeKind::BreakAutoContinue
            )
        {
            last = IterationOutcome {
                kind: OutcomeKind::BreakMaxIterations,
                ..last
            };
        }
        let result = self.strategy.get_result(&state, &last, terminated_early);
        report(
            &self.progress,
            ProgressUpdate::transcript(format!(
                "run finished: {} ({} iterations)",
                result.termination_reason, result.iterations_executed
            )),
        );
        result
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use runa_config::{ProviderLimits, RetryConfig, ToolsConfig};
    use runa_model::{
        CompletionResponse, RateLimitGate, Role, ScriptedProvider, ToolCallRecord,
    };
    use runa_session::{Authorizer, ScriptedInteraction, Session};
    use runa_tools::{register_builtin, ToolContext, ToolRegistry};

    use crate::strategy::DefaultStrategy;

    fn build(
        provider: ScriptedProvider,
        dir: &std::path::Path,
    ) -> (Orchestrator, Arc<Session>) {
        let session = Arc::new(Session::new(dir));
        let ui = Arc::new(ScriptedInteraction::new(vec![]));
        let authorizer = Arc::new(Authorizer::new(Arc::clone(&session), ui.clone()));
        let registry = Arc::new(ToolRegistry::new());
        register_builtin(&registry, &ToolsConfig::default());
        let ctx = ToolContext::new(Arc::clone(&session), authorizer, ui);
        let exec = Arc::new(IterationExecutor::new(
            Arc::clone(&session),
            registry,
            Arc::new(provider),
            Arc::new(RateLimitGate::new(ProviderLimits::default())),
            RetryConfig {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_secs: 1,
            },
            ctx,
            "system",
        ));
        (
            Orchestrator::new(exec, Arc::new(DefaultStrategy), 16, 3),
            session,
        )
    }

    #[tokio::test]
    async fn happy_path_no_tools() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, session) = build(ScriptedProvider::always_text("hi."), dir.path());
        session.push(Message::user("Say hi."));
        let result = orch.run(&CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.iterations_executed, 1);
        assert_eq!(result.termination_reason, "completed normally");
        assert_eq!(result.content, "hi.");
        // Exactly one assistant message was added.
        assert_eq!(session.len(), 2);
    }

    #[tokio::test]
    async fn single_tool_call_then_finish() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha\n").unwrap();
        let (orch, session) = build(
            ScriptedProvider::tool_then_text("t1", "read_file", "{\"path\":\"a.txt\"}", "done"),
            dir.path(),
        );
        session.push(Message::user("read it"));
        let result = orch.run(&CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.iterations_executed, 2);
        let snap = session.snapshot();
        // user, assistant(t1), tool(t1), assistant("done")
        assert_eq!(snap.len(), 4);
        assert_eq!(snap[1].tool_calls[0].id, "t1");
        assert_eq!(snap[2].tool_call_id.as_deref(), Some("t1"));
        assert_eq!(snap[3].content, "done");
    }

    #[tokio::test]
    async fn iteration_limit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // The model calls a harmless tool forever.
        let endless: Vec<CompletionResponse> = (0..64)
            .map(|i| {
                CompletionResponse::calls(vec![ToolCallRecord {
                    id: format!("c{i}"),
                    name: "status_program".into(),
                    arguments: "{}".into(),
                }])
            })
            .collect();
        let (orch, session) = build(ScriptedProvider::new(endless), dir.path());
        session.push(Message::user("loop forever"));
        let result = orch.run(&CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.hit_iteration_limit);
        assert_eq!(result.iterations_executed, 16);
        assert_eq!(result.termination_reason, "iteration limit reached");
    }

    #[tokio::test]
    async fn loop_detection_fails_the_run_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        // Trailing ':' keeps the answer truncated-looking, so auto-continue
        // feeds the same paragraph back in until the detector fires.
        let para = "Let me think about this problem once more from first principles \
                    before writing any code for the task at hand:";
        let (orch, session) = build(ScriptedProvider::always_text(para), dir.path());
        session.push(Message::user("go"));
        let result = orch.run(&CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.loop_detected);
        assert_eq!(result.termination_reason, "loop detected");
        assert!(result.metadata["loop_count"].as_u64().unwrap() >= 2);
        assert!(!result.metadata["loop_pattern"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_continue_fires_on_truncated_output_and_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, session) = build(
            ScriptedProvider::new(vec![
                CompletionResponse::text("The steps are:"),
                CompletionResponse::text("1. read 2. write. All done now."),
            ]),
            dir.path(),
        );
        session.push(Message::user("list the steps"));
        let result = orch.run(&CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.auto_continue_attempts, 1);
        assert_eq!(result.iterations_executed, 2);
        // The nudge message is in the history between the two answers.
        let snap = session.snapshot();
        assert!(snap
            .iter()
            .any(|m| m.role == Role::User && m.content.contains("Continue exactly")));
    }

    #[tokio::test]
    async fn whitespace_only_answer_does_not_auto_continue() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, session) = build(ScriptedProvider::always_text("   "), dir.path());
        session.push(Message::user("go"));
        let result = orch.run(&CancellationToken::new()).await;
        assert_eq!(result.auto_continue_attempts, 0);
        assert_eq!(result.iterations_executed, 1);
    }

    #[tokio::test]
    async fn cancellation_before_start_terminates_early() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, session) = build(ScriptedProvider::always_text("x"), dir.path());
        session.push(Message::user("go"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = orch.run(&cancel).await;
        assert!(!result.success);
        assert_eq!(result.iterations_executed, 0);
        assert_eq!(result.termination_reason, "terminated by external signal");
        // No assistant message was appended.
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn iterations_never_exceed_configured_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let endless: Vec<CompletionResponse> = (0..100)
            .map(|i| {
                CompletionResponse::calls(vec![ToolCallRecord {
                    id: format!("c{i}"),
                    name: "status_program".into(),
                    arguments: "{}".into(),
                }])
            })
            .collect();
        let (orch, session) = build(ScriptedProvider::new(endless), dir.path());
        session.push(Message::user("go"));
        let result = orch.run(&CancellationToken::new()).await;
        assert!(result.iterations_executed <= 16);
    }

    #[tokio::test]
    async fn progress_sink_receives_updates() {
        let dir = tempfile::tempdir().unwrap();
        let seen: Arc<Mutex<Vec<ProgressUpdate>>> = Default::default();
        let seen2 = Arc::clone(&seen);
        let (orch, session) = build(ScriptedProvider::always_text("done."), dir.path());
        let orch = orch.with_progress(Arc::new(move |u| seen2.lock().unwrap().push(u)));
        session.push(Message::user("go"));
        orch.run(&CancellationToken::new()).await;
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|u| u.mode == crate::events::ReportMode::JustStatus));
        assert!(seen.iter().any(|u| u.mode == crate::events::ReportMode::NoStatus));
    }
}
