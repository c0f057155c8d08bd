// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end runs of the orchestrator and planning loops against the
//! scripted mock provider — no network, no real model.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use runa_config::{ProviderLimits, RetryConfig, ToolsConfig};
use runa_core::{
    ContextManager, DefaultStrategy, IterationExecutor, Orchestrator, PlanRequest, PlanningLoop,
};
use runa_model::{
    CompletionResponse, Message, RateLimitGate, Role, ScriptedProvider, ToolCallRecord,
};
use runa_session::{Authorizer, ScriptedInteraction, Session};
use runa_tools::{register_builtin, ToolContext, ToolRegistry, PLANNING_TOOLS};

struct Harness {
    session: Arc<Session>,
    executor: Arc<IterationExecutor>,
}

fn harness(provider: ScriptedProvider, dir: &std::path::Path, planning: bool) -> Harness {
    let session = Arc::new(Session::new(dir));
    let ui = Arc::new(ScriptedInteraction::new(vec![]));
    let authorizer = Arc::new(Authorizer::new(Arc::clone(&session), ui.clone()));
    let registry = Arc::new(ToolRegistry::new());
    register_builtin(&registry, &ToolsConfig::default());
    let registry = if planning {
        Arc::new(registry.subset(PLANNING_TOOLS))
    } else {
        registry
    };
    let ctx = ToolContext::new(Arc::clone(&session), authorizer, ui);
    let executor = Arc::new(IterationExecutor::new(
        Arc::clone(&session),
        registry,
        Arc::new(provider),
        Arc::new(RateLimitGate::new(ProviderLimits::default())),
        RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_secs: 1,
        },
        ctx,
        "integration test system prompt",
    ));
    Harness { session, executor }
}

fn orchestrator(h: &Harness, max_iterations: u32) -> Orchestrator {
    Orchestrator::new(
        Arc::clone(&h.executor),
        Arc::new(DefaultStrategy),
        max_iterations,
        3,
    )
}

// ─── Scenario: happy path, no tools ──────────────────────────────────────────

#[tokio::test]
async fn happy_path_no_tools() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(ScriptedProvider::always_text("hi."), dir.path(), false);
    h.session.push(Message::user("Say hi."));

    let result = orchestrator(&h, 8).run(&CancellationToken::new()).await;

    assert!(result.success);
    assert_eq!(result.iterations_executed, 1);
    assert_eq!(result.termination_reason, "completed normally");
    // The session grew by exactly one assistant message.
    let snap = h.session.snapshot();
    assert_eq!(snap.len(), 2);
    assert_eq!(snap[1].role, Role::Assistant);
    assert_eq!(snap[1].content, "hi.");
}

// ─── Scenario: single tool call then finish ──────────────────────────────────

#[tokio::test]
async fn single_tool_call_then_finish() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "first line\nsecond line\n").unwrap();
    let h = harness(
        ScriptedProvider::tool_then_text(
            "t1",
            "read_file",
            r#"{"path":"a.txt","from_line":0,"to_line":0}"#,
            "done",
        ),
        dir.path(),
        false,
    );
    h.session.push(Message::user("read a.txt"));

    let result = orchestrator(&h, 8).run(&CancellationToken::new()).await;

    assert!(result.success);
    assert_eq!(result.iterations_executed, 2);
    let snap = h.session.snapshot();
    // user, assistant(call t1), tool(t1), assistant("done")
    assert_eq!(snap.len(), 4);
    assert_eq!(snap[1].tool_calls[0].id, "t1");
    assert_eq!(snap[2].role, Role::Tool);
    assert_eq!(snap[2].tool_call_id.as_deref(), Some("t1"));
    assert_eq!(snap[2].tool_name.as_deref(), Some("read_file"));
    assert!(snap[2].content.contains("[1] first line"));
    assert!(snap[2].content.contains("[2] second line"));
    assert_eq!(snap[3].content, "done");
    // The read-set contains a.txt.
    let resolved = h.session.resolve_path("a.txt").unwrap();
    assert!(h.session.was_read(&resolved));
}

// ─── Scenario: loop detected ─────────────────────────────────────────────────

#[tokio::test]
async fn repeated_output_trips_the_loop_detector() {
    let dir = tempfile::tempdir().unwrap();
    // ~150 chars, and truncated-looking so the loop keeps going on its own.
    let paragraph = "I am going to carefully restate the entire approach to this \
                     problem one more time before actually beginning with any of \
                     the implementation steps:";
    let h = harness(ScriptedProvider::always_text(paragraph), dir.path(), false);
    h.session.push(Message::user("go"));

    let provider_calls = {
        let result = orchestrator(&h, 64).run(&CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.loop_detected);
        assert!(result.metadata["loop_count"].as_u64().unwrap() >= 4);
        assert!(!result.metadata["loop_pattern"].as_str().unwrap().is_empty());
        result.iterations_executed
    };
    // The detector fired on the fourth identical turn; no fifth model call.
    assert_eq!(provider_calls, 4);
}

// ─── Scenario: compaction mid-run ────────────────────────────────────────────

#[tokio::test]
async fn compaction_mid_run_replaces_head_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::always_text("all wrapped up.").with_context_window(200);
    let h = harness(provider, dir.path(), false);

    let orch = orchestrator(&h, 8);
    let summarizer = Arc::new(
        ScriptedProvider::new(vec![]).with_prompt_replies(vec!["compact summary".into()]),
    );
    assert!(orch.set_context_manager(Arc::new(ContextManager::new(
        summarizer,
        0.9,
        2,
        3,
        Duration::from_secs(30),
    ))));

    // Fill the session beyond 90% of the 200-token window.
    for i in 0..6 {
        h.session.push(Message::user(format!(
            "turn {i}: {}",
            "lorem ipsum dolor sit amet ".repeat(8)
        )));
    }
    let before = h.session.snapshot();

    let result = orch.run(&CancellationToken::new()).await;
    assert!(result.success, "{}", result.termination_reason);
    // Iteration 1 requested compaction, iteration 2 completed.
    assert_eq!(result.iterations_executed, 2);

    let snap = h.session.snapshot();
    // Head replaced by exactly one system-role summary.
    assert_eq!(snap[0].role, Role::System);
    assert!(snap[0].content.contains("compact summary"));
    assert_eq!(
        snap.iter().filter(|m| m.role == Role::System).count(),
        1
    );
    // The preserved tail retains its relative order, and the final assistant
    // answer comes after it.
    let kept: Vec<&str> = snap
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    assert!(kept[0] < kept[1], "preserved tail must stay ordered");
    assert_eq!(snap.last().unwrap().content, "all wrapped up.");
    // Original head messages are gone.
    assert!(snap.len() < before.len() + 1);
}

// ─── Property: tool results pair with their assistant turn ───────────────────

#[tokio::test]
async fn tool_results_follow_their_assistant_turn_exactly() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("x.txt"), "x\n").unwrap();
    std::fs::write(dir.path().join("y.txt"), "y\n").unwrap();
    let h = harness(
        ScriptedProvider::new(vec![
            CompletionResponse::calls(vec![
                ToolCallRecord {
                    id: "a".into(),
                    name: "read_file".into(),
                    arguments: r#"{"path":"x.txt"}"#.into(),
                },
                ToolCallRecord {
                    id: "b".into(),
                    name: "read_file".into(),
                    arguments: r#"{"path":"y.txt"}"#.into(),
                },
                ToolCallRecord {
                    id: "c".into(),
                    name: "status_program".into(),
                    arguments: "{}".into(),
                },
            ]),
            CompletionResponse::text("done"),
        ]),
        dir.path(),
        false,
    );
    h.session.push(Message::user("go"));

    orchestrator(&h, 8).run(&CancellationToken::new()).await;

    let snap = h.session.snapshot();
    for (i, msg) in snap.iter().enumerate() {
        if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
            let n = msg.tool_calls.len();
            let want: HashSet<&str> = msg.tool_calls.iter().map(|c| c.id.as_str()).collect();
            let got: HashSet<&str> = snap[i + 1..i + 1 + n]
                .iter()
                .map(|m| {
                    assert_eq!(m.role, Role::Tool, "tool results must follow immediately");
                    m.tool_call_id.as_deref().unwrap()
                })
                .collect();
            assert_eq!(want, got, "result ids must match the call ids exactly");
        }
    }
}

// ─── Scenario: planning board with complete=false ────────────────────────────

#[tokio::test]
async fn planning_board_with_complete_false_still_returns_plan() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedProvider::always_text(
            r#"<answer>{"mode":"board","board":{"primary_tasks":[{"id":"1","text":"t"}]} ,"complete":false}</answer>"#,
        ),
        dir.path(),
        true,
    );
    let planning = PlanningLoop::new(Arc::clone(&h.executor), Arc::new(DefaultStrategy), 96);

    let outcome = planning
        .run(&PlanRequest::new("plan the work"), &CancellationToken::new())
        .await;

    assert!(outcome.plan.has_content());
    assert!(!outcome.plan.complete);
    let board = outcome.plan.board.expect("board plan");
    assert_eq!(board.primary_tasks.len(), 1);
    assert_eq!(board.primary_tasks[0].id, "1");
    assert_eq!(board.primary_tasks[0].text, "t");
}

// ─── Property: planning prefix is stable across requests ─────────────────────

#[tokio::test]
async fn planning_prefix_is_byte_identical_across_requests() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ctx.md"), "context\n").unwrap();
    let provider = ScriptedProvider::new(vec![
        CompletionResponse::calls(vec![ToolCallRecord {
            id: "s1".into(),
            name: "search_files".into(),
            arguments: r#"{"pattern":"*.md"}"#.into(),
        }]),
        CompletionResponse::calls(vec![ToolCallRecord {
            id: "s2".into(),
            name: "search_file_content".into(),
            arguments: r#"{"pattern":"context"}"#.into(),
        }]),
        CompletionResponse::text(r#"<answer>{"mode":"simple","plan":["step"],"complete":true}</answer>"#),
    ]);
    let requests = provider.requests();
    let h = harness(provider, dir.path(), true);
    let planning = PlanningLoop::new(Arc::clone(&h.executor), Arc::new(DefaultStrategy), 96);

    let mut request = PlanRequest::new("plan it");
    request.context_files = vec!["ctx.md".into()];
    let outcome = planning.run(&request, &CancellationToken::new()).await;
    assert!(outcome.plan.has_content());

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    let prefix_len = 2; // objective + context-file dump
    let canonical: Vec<String> = requests[0].messages[..prefix_len]
        .iter()
        .map(|m| serde_json::to_string(&**m).unwrap())
        .collect();
    for req in requests.iter() {
        assert_eq!(req.system_prompt, requests[0].system_prompt);
        for (i, expected) in canonical.iter().enumerate() {
            let actual = serde_json::to_string(&*req.messages[i]).unwrap();
            assert_eq!(&actual, expected, "prefix message {i} must be byte-identical");
        }
    }
}
