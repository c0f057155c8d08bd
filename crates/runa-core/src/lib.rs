// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod context;
mod detector;
mod events;
mod iteration;
mod orchestrator;
mod outcome;
mod plan;
mod planning;
mod strategy;

pub use context::ContextManager;
pub use detector::{Detection, LoopDetector};
pub use events::{report, ProgressSink, ProgressUpdate, ReportMode};
pub use iteration::IterationExecutor;
pub use orchestrator::Orchestrator;
pub use outcome::{IterationOutcome, OutcomeKind, RunResult};
pub use plan::{
    extract_plan, serialize_plan, Plan, PlanBoard, PlanMode, PlanTask, TaskPriority, TaskStatus,
};
pub use planning::{PlanOutcome, PlanRequest, PlanningLoop};
pub use strategy::{
    looks_truncated, strategy_for, AggressiveStrategy, ConservativeStrategy, DefaultStrategy,
    JudgeStrategy, LoopState, Strategy,
};
