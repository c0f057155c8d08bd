// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};
use runa_config::Config;
use runa_core::{
    strategy_for, ContextManager, IterationExecutor, Orchestrator, PlanMode, PlanRequest,
    PlanningLoop, ProgressSink, ProgressUpdate, ReportMode,
};
use runa_model::{provider_from_config, Message, ModelProvider, RateLimitGates};
use runa_sandbox::SandboxTool;
use runa_session::{Authorizer, Session, TerminalInteraction, UserInteraction};
use runa_tools::{register_builtin, ToolContext, ToolRegistry, PLANNING_TOOLS};

const SYSTEM_PROMPT: &str = "You are a capable software engineering agent. Work \
toward the user's objective with the provided tools. Read files before editing \
them, prefer small verifiable steps, and when the objective is met answer with \
a concise summary and no further tool calls.";

const PLANNING_PROMPT: &str = "You are a planning agent. Investigate with the \
provided read-only tools, ask the user when a decision is theirs to make, then \
answer with an <answer>{...}</answer> envelope containing JSON: either \
{\"mode\":\"simple\",\"plan\":[...],\"complete\":true} or \
{\"mode\":\"board\",\"board\":{\"primary_tasks\":[...]},\"complete\":true}. \
Tasks carry id, text, optional priority (high/medium/low), optional status \
(pending/in_progress/completed) and optional subtasks.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(runa_config::load(cli.config.as_deref())?);

    match cli.command {
        Commands::Run {
            ref objective,
            ref root,
            ref transcript,
        } => {
            let code = run_objective(&config, objective, root.clone(), transcript.clone()).await?;
            std::process::exit(code);
        }
        Commands::Plan {
            ref objective,
            ref root,
            ref context_files,
            max_questions,
            json,
        } => {
            let code =
                run_planner(&config, objective, root.clone(), context_files, max_questions, json)
                    .await?;
            std::process::exit(code);
        }
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&*config)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Everything a loop run needs, wired together from the config.
struct Runtime {
    session: Arc<Session>,
    executor: Arc<IterationExecutor>,
    provider: Arc<dyn ModelProvider>,
    summarizer: Arc<dyn ModelProvider>,
}

async fn build_runtime(
    config: &Config,
    root: Option<PathBuf>,
    planning: bool,
) -> anyhow::Result<Runtime> {
    let root = match root {
        Some(r) => r,
        None => std::env::current_dir().context("cannot determine working directory")?,
    };
    let session = Arc::new(Session::new(&root));
    let ui: Arc<dyn UserInteraction> = Arc::new(TerminalInteraction);
    let authorizer = Arc::new(Authorizer::new(Arc::clone(&session), Arc::clone(&ui)));

    let provider = provider_from_config(&config.model)?;
    let summarizer = match &config.summarizer {
        Some(cfg) => provider_from_config(cfg)?,
        None => Arc::clone(&provider),
    };

    let registry = Arc::new(ToolRegistry::new());
    register_builtin(&registry, &config.tools);
    let registry = if planning {
        Arc::new(registry.subset(PLANNING_TOOLS))
    } else {
        if SandboxTool::toolchain_available(&config.sandbox.tinygo_path).await {
            registry.register(SandboxTool::new(
                config.sandbox.clone(),
                Arc::clone(&summarizer),
                provider.context_window(),
            ));
        } else {
            debug!("TinyGo not found; go_sandbox is unavailable");
        }
        registry
    };

    let gates = RateLimitGates::new(config.limits.clone());
    let gate = gates.gate_for(provider.name());
    let tool_ctx = ToolContext::new(Arc::clone(&session), authorizer, ui);
    let executor = Arc::new(
        IterationExecutor::new(
            Arc::clone(&session),
            registry,
            Arc::clone(&provider),
            gate,
            config.retry.clone(),
            tool_ctx,
            if planning { PLANNING_PROMPT } else { SYSTEM_PROMPT },
        )
        .with_sampling(config.model.temperature, config.model.max_tokens)
        .with_caching(config.model.cache_prompt_prefix, config.model.cache_ttl.clone()),
    );

    Ok(Runtime {
        session,
        executor,
        provider,
        summarizer,
    })
}

/// Progress printer: transcript lines to stdout, spinner text to stderr.
fn console_sink() -> ProgressSink {
    Arc::new(|update: ProgressUpdate| match update.mode {
        ReportMode::NoStatus => println!("{}", update.message),
        ReportMode::JustStatus => {
            eprint!("\r\x1b[2K{}", update.message);
            let _ = std::io::stderr().flush();
        }
    })
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted; shutting down");
            c.cancel();
        }
    });
    cancel
}

async fn run_objective(
    config: &Config,
    objective: &str,
    root: Option<PathBuf>,
    transcript: Option<PathBuf>,
) -> anyhow::Result<i32> {
    let rt = build_runtime(config, root, false).await?;

    let strategy = strategy_for(config.agent.strategy, Arc::clone(&rt.summarizer));
    let orchestrator = Orchestrator::new(
        Arc::clone(&rt.executor),
        Arc::clone(&strategy),
        config.agent.max_iterations,
        config.agent.auto_continue_max_attempts,
    )
    .with_progress(console_sink());
    orchestrator.set_context_manager(Arc::new(ContextManager::new(
        Arc::clone(&rt.summarizer),
        strategy.effective_compaction_threshold(config.agent.compaction_threshold),
        config.agent.compaction_keep_recent,
        config.agent.max_consecutive_compactions,
        Duration::from_secs(config.agent.compaction_window_secs),
    )));

    rt.session.push(Message::user(objective));
    let cancel = cancel_on_ctrl_c();
    let result = orchestrator.run(&cancel).await;

    if let Some(path) = transcript {
        std::fs::write(&path, rt.session.to_json()?)
            .with_context(|| format!("cannot write transcript to {}", path.display()))?;
        eprintln!("transcript saved to {}", path.display());
    }

    eprintln!();
    eprintln!(
        "{} after {} iteration(s) via {}",
        result.termination_reason,
        result.iterations_executed,
        rt.provider.model_name()
    );
    if let Some(error) = &result.error {
        eprintln!("error: {error}");
    }
    Ok(if result.success { 0 } else { 1 })
}

async fn run_planner(
    config: &Config,
    objective: &str,
    root: Option<PathBuf>,
    context_files: &[PathBuf],
    max_questions: usize,
    json: bool,
) -> anyhow::Result<i32> {
    let rt = build_runtime(config, root, true).await?;

    let planning = PlanningLoop::new(
        Arc::clone(&rt.executor),
        strategy_for(runa_config::StrategyKind::Default, Arc::clone(&rt.summarizer)),
        config.agent.planning_max_iterations,
    )
    .with_progress(console_sink());

    let mut request = PlanRequest::new(objective);
    request.context_files = context_files.to_vec();
    request.max_questions = max_questions;

    let cancel = cancel_on_ctrl_c();
    let outcome = planning.run(&request, &cancel).await;

    eprintln!();
    if json {
        println!("{}", runa_core::serialize_plan(&outcome.plan));
    } else {
        print_plan(&outcome.plan);
    }
    if outcome.needs_input {
        eprintln!("(plan is partial: more user input is needed)");
    }
    eprintln!(
        "{} after {} iteration(s)",
        outcome.termination_reason, outcome.iterations_executed
    );
    Ok(if outcome.plan.has_content() { 0 } else { 1 })
}

fn print_plan(plan: &runa_core::Plan) {
    match plan.mode {
        PlanMode::Simple => {
            for (i, step) in plan.steps.iter().enumerate() {
                println!("{}. {step}", i + 1);
            }
        }
        PlanMode::Board => {
            if let Some(board) = &plan.board {
                for task in &board.primary_tasks {
                    print_task(task, 0);
                }
            }
        }
    }
}

fn print_task(task: &runa_core::PlanTask, depth: usize) {
    let indent = "  ".repeat(depth);
    let mut line = format!("{indent}[{}] {}", task.id, task.text);
    if let Some(priority) = &task.priority {
        line.push_str(&format!(" ({priority:?})"));
    }
    if let Some(status) = &task.status {
        line.push_str(&format!(" — {status:?}"));
    }
    println!("{line}");
    for sub in &task.subtasks {
        print_task(sub, depth + 1);
    }
}
