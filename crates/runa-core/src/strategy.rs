// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use runa_model::{ModelProvider, Role};
use runa_session::Session;

use crate::detector::LoopDetector;
use crate::outcome::{IterationOutcome, OutcomeKind, RunResult};

/// Counters the strategy predicates act on.
#[derive(Debug, Clone, Copy)]
pub struct LoopState {
    pub iteration: u32,
    pub max_iterations: u32,
    pub auto_continue_attempts: u32,
    pub auto_continue_max: u32,
}

/// The pluggable predicate set driving the orchestrator: keep looping?
/// nudge one more turn out of a truncated answer?  and how to fold the final
/// outcome into a result.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn should_continue(&self, state: &LoopState, outcome: &IterationOutcome) -> bool;

    async fn should_auto_continue(
        &self,
        state: &LoopState,
        session: &Session,
        content: &str,
    ) -> bool;

    fn get_result(
        &self,
        state: &LoopState,
        last: &IterationOutcome,
        terminated_early: bool,
    ) -> RunResult;

    /// Budget adjustments applied on top of the configured values.
    fn effective_max_iterations(&self, configured: u32) -> u32 {
        configured
    }
    fn effective_auto_continue_max(&self, configured: u32) -> u32 {
        configured
    }
    fn effective_compaction_threshold(&self, configured: f32) -> f32 {
        configured
    }
}

/// Shared result builder: every canned strategy folds state the same way.
pub(crate) fn build_result(
    state: &LoopState,
    last: &IterationOutcome,
    terminated_early: bool,
) -> RunResult {
    let cancelled = terminated_early || last.is_cancellation();
    let (success, reason) = if cancelled {
        (false, "terminated by external signal".to_string())
    } else {
        match last.kind {
            OutcomeKind::Break | OutcomeKind::BreakAutoContinue => {
                (true, "completed normally".to_string())
            }
            OutcomeKind::BreakMaxIterations => (false, "iteration limit reached".to_string()),
            OutcomeKind::BreakLoopDetected => (false, "loop detected".to_string()),
            OutcomeKind::Error => (
                false,
                last.error.clone().unwrap_or_else(|| "error".to_string()),
            ),
            OutcomeKind::Continue | OutcomeKind::CompactionNeeded => {
                (false, "stopped before completion".to_string())
            }
        }
    };
    RunResult {
        success,
        iterations_executed: state.iteration,
        auto_continue_attempts: state.auto_continue_attempts,
        hit_iteration_limit: last.kind == OutcomeKind::BreakMaxIterations,
        loop_detected: last.kind == OutcomeKind::BreakLoopDetected,
        termination_reason: reason,
        error: last.error.clone(),
        metadata: last.metadata.clone(),
        content: last.content.clone(),
    }
}

/// Does `content` look cut off mid-thought?
///
/// Fires on trailing `:` / `…` / open brackets and quotes, trailing
/// enumeration phrases, an odd number of code fences, or a final line that
/// is the stub of a numbered or bulleted list.  Whitespace-only content is
/// never truncated-looking.
pub fn looks_truncated(content: &str) -> bool {
    let trimmed = content.trim_end();
    if trimmed.trim().is_empty() {
        return false;
    }

    if trimmed.matches("```").count() % 2 == 1 {
        return true;
    }

    if let Some(last) = trimmed.chars().last() {
        if matches!(last, ':' | '…' | '(' | '[' | '{' | '"' | '\'' | '`') {
            return true;
        }
    }

    let lower = trimmed.to_lowercase();
    for phrase in ["such as", "including", "for example"] {
        if lower.ends_with(phrase) {
            return true;
        }
    }

    // "1." / "2)" / "-" / "*" alone on the final line.
    if let Some(line) = trimmed.lines().last() {
        let line = line.trim();
        let is_numbered_stub = line
            .strip_suffix(['.', ')'])
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        if is_numbered_stub || matches!(line, "-" | "*" | "+") {
            return true;
        }
    }

    false
}

// ─── Default ──────────────────────────────────────────────────────────────────

pub struct DefaultStrategy;

#[async_trait]
impl Strategy for DefaultStrategy {
    fn should_continue(&self, state: &LoopState, outcome: &IterationOutcome) -> bool {
        if state.iteration >= state.max_iterations {
            return false;
        }
        matches!(
            outcome.kind,
            OutcomeKind::Continue | OutcomeKind::CompactionNeeded | OutcomeKind::BreakAutoContinue
        )
    }

    async fn should_auto_continue(
        &self,
        state: &LoopState,
        _session: &Session,
        content: &str,
    ) -> bool {
        state.auto_continue_attempts < state.auto_continue_max && looks_truncated(content)
    }

    fn get_result(
        &self,
        state: &LoopState,
        last: &IterationOutcome,
        terminated_early: bool,
    ) -> RunResult {
        build_result(state, last, terminated_early)
    }
}

// ─── Conservative ─────────────────────────────────────────────────────────────

/// Half the budgets, compacts earlier, and stops on anything that is not a
/// plain continue.
pub struct ConservativeStrategy;

#[async_trait]
impl Strategy for ConservativeStrategy {
    fn should_continue(&self, state: &LoopState, outcome: &IterationOutcome) -> bool {
        state.iteration < state.max_iterations && outcome.kind == OutcomeKind::Continue
    }

    async fn should_auto_continue(
        &self,
        state: &LoopState,
        _session: &Session,
        content: &str,
    ) -> bool {
        state.auto_continue_attempts < state.auto_continue_max && looks_truncated(content)
    }

    fn get_result(
        &self,
        state: &LoopState,
        last: &IterationOutcome,
        terminated_early: bool,
    ) -> RunResult {
        build_result(state, last, terminated_early)
    }

    fn effective_max_iterations(&self, configured: u32) -> u32 {
        (configured / 2).max(1)
    }
    fn effective_auto_continue_max(&self, configured: u32) -> u32 {
        configured / 2
    }
    fn effective_compaction_threshold(&self, configured: f32) -> f32 {
        (configured - 0.1).max(0.1)
    }
}

// ─── Aggressive ───────────────────────────────────────────────────────────────

/// Double budgets; auto-continue whenever the budget allows.
pub struct AggressiveStrategy;

#[async_trait]
impl Strategy for AggressiveStrategy {
    fn should_continue(&self, state: &LoopState, outcome: &IterationOutcome) -> bool {
        DefaultStrategy.should_continue(state, outcome)
    }

    async fn should_auto_continue(
        &self,
        state: &LoopState,
        _session: &Session,
        content: &str,
    ) -> bool {
        state.auto_continue_attempts < state.auto_continue_max && !content.trim().is_empty()
    }

    fn get_result(
        &self,
        state: &LoopState,
        last: &IterationOutcome,
        terminated_early: bool,
    ) -> RunResult {
        build_result(state, last, terminated_early)
    }

    fn effective_max_iterations(&self, configured: u32) -> u32 {
        configured.saturating_mul(2)
    }
    fn effective_auto_continue_max(&self, configured: u32) -> u32 {
        configured.saturating_mul(2)
    }
}

// ─── LLM judge ────────────────────────────────────────────────────────────────

/// Default predicates, but auto-continue consults a small model.
///
/// A hard repetition check runs first: when the recent assistant history
/// loops, auto-continue is refused outright and the judge is never asked.
pub struct JudgeStrategy {
    judge: Arc<dyn ModelProvider>,
    /// Strict parsing takes only a leading CONTINUE/STOP token; lenient
    /// parsing accepts the verdict anywhere in the reply.
    strict: bool,
}

impl JudgeStrategy {
    pub fn new(judge: Arc<dyn ModelProvider>) -> Self {
        Self {
            judge,
            strict: true,
        }
    }

    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }
}

/// Parse the judge's reply into a continue/stop verdict.  Anything
/// unparseable means stop.
fn parse_verdict(reply: &str, strict: bool) -> bool {
    let upper = reply.trim().to_ascii_uppercase();
    if strict {
        let first = upper
            .split(|c: char| !c.is_ascii_alphabetic())
            .find(|t| !t.is_empty())
            .unwrap_or("");
        first == "CONTINUE"
    } else {
        upper.contains("CONTINUE") && !upper.contains("STOP")
    }
}

#[async_trait]
impl Strategy for JudgeStrategy {
    fn should_continue(&self, state: &LoopState, outcome: &IterationOutcome) -> bool {
        DefaultStrategy.should_continue(state, outcome)
    }

    async fn should_auto_continue(
        &self,
        state: &LoopState,
        session: &Session,
        content: &str,
    ) -> bool {
        if state.auto_continue_attempts >= state.auto_continue_max || content.trim().is_empty() {
            return false;
        }

        let snapshot = session.snapshot();

        // Hard check: repetition in the recent assistant history refuses
        // auto-continue unconditionally.
        let mut detector = LoopDetector::new(3, 32 * 1024);
        let mut looped = false;
        for m in snapshot
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .take(6)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
        {
            if detector.add(&m.content).is_loop {
                looped = true;
            }
        }
        if looped {
            debug!("judge skipped: recent assistant history repeats");
            return false;
        }

        let recent_users: Vec<&str> = snapshot
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .take(2)
            .map(|m| m.content.as_str())
            .collect();
        let excerpt: String = content.chars().rev().take(500).collect::<String>()
            .chars().rev().collect();

        let prompt = format!(
            "An assistant may have stopped mid-answer. Reply with exactly one \
             word, CONTINUE or STOP.\n\nRecent user prompts:\n{}\n\nEnd of the \
             assistant's answer:\n{}",
            recent_users.join("\n"),
            excerpt
        );
        match self.judge.complete_prompt(&prompt).await {
            Ok(reply) => parse_verdict(&reply, self.strict),
            Err(_) => false,
        }
    }

    fn get_result(
        &self,
        state: &LoopState,
        last: &IterationOutcome,
        terminated_early: bool,
    ) -> RunResult {
        build_result(state, last, terminated_early)
    }
}

/// Construct the configured strategy variant.
pub fn strategy_for(
    kind: runa_config::StrategyKind,
    judge: Arc<dyn ModelProvider>,
) -> Arc<dyn Strategy> {
    match kind {
        runa_config::StrategyKind::Default => Arc::new(DefaultStrategy),
        runa_config::StrategyKind::Conservative => Arc::new(ConservativeStrategy),
        runa_config::StrategyKind::Aggressive => Arc::new(AggressiveStrategy),
        runa_config::StrategyKind::Judge => Arc::new(JudgeStrategy::new(judge)),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
