// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde_json::Value;

use runa_model::ToolCallRecord;

/// How one iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// Tool calls were executed; the loop should run another turn.
    Continue,
    /// The model answered in text; the run is (presumably) complete.
    Break,
    /// The answer looked truncated; one more turn was requested.
    BreakAutoContinue,
    /// The iteration budget ran out.
    BreakMaxIterations,
    /// The repetition detector fired.
    BreakLoopDetected,
    /// The iteration failed.
    Error,
    /// The context manager must compact before the next model call.
    CompactionNeeded,
}

/// Everything the strategy needs to know about one finished iteration.
/// Transient; lives for the duration of one loop step.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub kind: OutcomeKind,
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub has_tool_calls: bool,
    pub metadata: HashMap<String, Value>,
    pub error: Option<String>,
}

impl IterationOutcome {
    fn base(kind: OutcomeKind) -> Self {
        Self {
            kind,
            content: String::new(),
            reasoning: None,
            tool_calls: Vec::new(),
            has_tool_calls: false,
            metadata: HashMap::new(),
            error: None,
        }
    }

    pub fn proceed(
        content: String,
        reasoning: Option<String>,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Self {
        Self {
            has_tool_calls: !tool_calls.is_empty(),
            content,
            reasoning,
            tool_calls,
            ..Self::base(OutcomeKind::Continue)
        }
    }

    pub fn finished(content: String, reasoning: Option<String>) -> Self {
        Self {
            content,
            reasoning,
            ..Self::base(OutcomeKind::Break)
        }
    }

    pub fn compaction_needed() -> Self {
        Self::base(OutcomeKind::CompactionNeeded)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::base(OutcomeKind::Error)
        }
    }

    pub fn loop_detected(pattern: String, count: usize) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("loop_pattern".to_string(), Value::String(pattern));
        metadata.insert("loop_count".to_string(), Value::from(count));
        Self {
            metadata,
            ..Self::base(OutcomeKind::BreakLoopDetected)
        }
    }

    /// True for the cancellation error shape produced by the executor.
    pub fn is_cancellation(&self) -> bool {
        self.kind == OutcomeKind::Error
            && self
                .error
                .as_deref()
                .is_some_and(|e| e.contains("cancel"))
    }
}

/// Final result of an orchestrator run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub success: bool,
    pub iterations_executed: u32,
    pub auto_continue_attempts: u32,
    pub hit_iteration_limit: bool,
    pub loop_detected: bool,
    pub termination_reason: String,
    pub error: Option<String>,
    pub metadata: HashMap<String, Value>,
    /// Final assistant content, when the run ended with one.
    pub content: String,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proceed_sets_has_tool_calls() {
        let with = IterationOutcome::proceed(
            String::new(),
            None,
            vec![ToolCallRecord {
                id: "1".into(),
                name: "shell".into(),
                arguments: "{}".into(),
            }],
        );
        assert!(with.has_tool_calls);
        assert_eq!(with.kind, OutcomeKind::Continue);

        let without = IterationOutcome::proceed(String::new(), None, vec![]);
        assert!(!without.has_tool_calls);
    }

    #[test]
    fn loop_detected_carries_pattern_and_count() {
        let o = IterationOutcome::loop_detected("again and again".into(), 4);
        assert_eq!(o.kind, OutcomeKind::BreakLoopDetected);
        assert_eq!(o.metadata["loop_pattern"], "again and again");
        assert_eq!(o.metadata["loop_count"], 4);
    }

    #[test]
    fn cancellation_shape_is_recognised() {
        assert!(IterationOutcome::failed("completion cancelled").is_cancellation());
        assert!(!IterationOutcome::failed("bad request").is_cancellation());
        assert!(!IterationOutcome::finished("done".into(), None).is_cancellation());
    }
}
