// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};
use wasmtime::{Config, Engine, Linker, Module, Store};
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::WasiCtxBuilder;

use runa_config::SandboxConfig;
use runa_model::{ModelProvider, OutputCompactor};
use runa_tools::{Tool, ToolCall, ToolContext, ToolOutput};

use crate::builder::{assemble_source, go_mod, Library, SandboxGlobals};
use crate::deadline::PausableDeadline;
use crate::hostcalls::{add_host_imports, HostState, SandboxHost};

/// Watchdog granularity.
const DEADLINE_TICK: Duration = Duration::from_millis(100);

/// Pipe capacity for captured stdio.
const PIPE_CAPACITY: usize = 8 * 1024 * 1024;

/// What came out of one module execution.
struct RunOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
    timed_out: bool,
}

/// Compiles a submitted Go program to WASM with TinyGo and runs it with
/// authorization-gated host imports.
pub struct SandboxTool {
    config: SandboxConfig,
    summarizer: Arc<dyn ModelProvider>,
    /// Context window of the primary model; bounds how much stdout may be
    /// returned uncompacted.
    model_context_window: usize,
    compactor: OutputCompactor,
    /// Previous-run globals, keyed by session id.
    globals: Mutex<HashMap<String, SandboxGlobals>>,
}

impl SandboxTool {
    pub fn new(
        config: SandboxConfig,
        summarizer: Arc<dyn ModelProvider>,
        model_context_window: usize,
    ) -> Self {
        let compactor = OutputCompactor::new(Arc::clone(&summarizer));
        Self {
            config,
            summarizer,
            model_context_window,
            compactor,
            globals: Mutex::new(HashMap::new()),
        }
    }

    /// True when the TinyGo toolchain responds.  The tool is not registered
    /// (or fails fast) otherwise.
    pub async fn toolchain_available(tinygo: &str) -> bool {
        tokio::process::Command::new(tinygo)
            .arg("version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn globals_for(&self, session_id: &str) -> SandboxGlobals {
        self.globals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    fn store_globals(&self, session_id: &str, globals: SandboxGlobals) {
        self.globals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string(), globals);
    }

    /// Compile `main.go` in `dir` to `prog.wasm`.
    async fn compile(&self, dir: &Path) -> Result<PathBuf, String> {
        let wasm_path = dir.join("prog.wasm");
        let output = tokio::process::Command::new(&self.config.tinygo_path)
            .args(["build", "-o", "prog.wasm", "-target=wasi", "main.go"])
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| format!("failed to run TinyGo: {e}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(40).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(format!("compile error:\n{}", tail.join("\n")));
        }
        Ok(wasm_path)
    }
}

#[async_trait]
impl Tool for SandboxTool {
    fn name(&self) -> &str {
        "go_sandbox"
    }

    fn description(&self) -> &str {
        "Run a short Go program in a WASM sandbox. The preamble provides \
         ExecuteCommand, Fetch, Summarize, ReadFile/WriteFile and friends; \
         every network, shell and filesystem action is authorization-gated. \
         os/exec, syscall and raw net are rejected. Results of the previous \
         run are available as LastExitCode / LastStdout / LastStderr. \
         libraries: optional [{name, version}] pinned in go.mod. \
         Timeout default 30 s, max 3600 s."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Go source; package clause and imports are merged automatically"
                },
                "libraries": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "version": { "type": "string" }
                        },
                        "required": ["name", "version"]
                    },
                    "description": "Module dependencies pinned in go.mod"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution budget in seconds (default 30, max 3600)"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory for ExecuteCommand, inside the session root"
                }
            },
            "required": ["code"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(code) = call.args.get("code").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required parameter 'code'");
        };

        if !Self::toolchain_available(&self.config.tinygo_path).await {
            return ToolOutput::err(
                &call.id,
                format!(
                    "go_sandbox is unavailable: TinyGo toolchain not found at '{}'",
                    self.config.tinygo_path
                ),
            );
        }

        let libraries: Vec<Library> = call
            .args
            .get("libraries")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|l| {
                        Some(Library {
                            name: l.get("name")?.as_str()?.to_string(),
                            version: l.get("version")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let timeout = Duration::from_secs(
            call.args
                .get("timeout_secs")
                .and_then(|v| v.as_u64())
                .unwrap_or(self.config.timeout_secs)
                .min(self.config.timeout_max_secs),
        );
        // The working directory must stay inside the session root; anything
        // resolving to a parent is rejected.
        let workdir = match call.args.get("workdir").and_then(|v| v.as_str()) {
            Some(wd) => match ctx.session.resolve_path(wd) {
                Ok(p) => p,
                Err(e) => return ToolOutput::err(&call.id, e.to_string()),
            },
            None => ctx.session.root().to_path_buf(),
        };

        let previous = self.globals_for(&ctx.session.id);
        let source = match assemble_source(code, &previous) {
            Ok(s) => s,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };

        // Per-invocation build directory; removed on every exit path when
        // the TempDir drops.
        let build_dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => return ToolOutput::err(&call.id, format!("tempdir error: {e}")),
        };
        if let Err(e) = tokio::fs::write(build_dir.path().join("main.go"), &source).await {
            return ToolOutput::err(&call.id, format!("write error: {e}"));
        }
        if let Err(e) = tokio::fs::write(build_dir.path().join("go.mod"), go_mod(&libraries)).await
        {
            return ToolOutput::err(&call.id, format!("write error: {e}"));
        }

        ctx.report_status("compiling sandbox program".to_string());
        let wasm_path = match self.compile(build_dir.path()).await {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(&call.id, e),
        };

        ctx.report_status("running sandbox program".to_string());
        let deadline = PausableDeadline::new(timeout, DEADLINE_TICK);
        let host = Arc::new(SandboxHost {
            session: Arc::clone(&ctx.session),
            authorizer: Arc::clone(&ctx.authorizer),
            summarizer: Arc::clone(&self.summarizer),
            deadline: Arc::clone(&deadline),
            handle: tokio::runtime::Handle::current(),
            http: reqwest::Client::new(),
            fetch_body_cap: self.config.fetch_body_cap,
            shell_timeout: Duration::from_secs(self.config.timeout_secs),
            workdir,
            denied_domains: Mutex::new(HashSet::new()),
        });

        let run = match run_module(&wasm_path, host, Arc::clone(&deadline), &ctx.cancel).await {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(&call.id, format!("sandbox error: {e}")),
        };

        self.store_globals(
            &ctx.session.id,
            SandboxGlobals {
                last_exit_code: run.exit_code,
                last_stdout: run.stdout.clone(),
                last_stderr: run.stderr.clone(),
            },
        );

        // Oversize stdout is summary-merged rather than dumped into context.
        let stdout_cap =
            (self.model_context_window as f32 * self.config.context_window_percent) as usize * 4;
        let stdout = if run.stdout.len() > stdout_cap.max(1024) {
            ctx.report_status("summarising sandbox output".to_string());
            debug!(bytes = run.stdout.len(), "compacting sandbox stdout");
            format!(
                "[stdout summarised from {} bytes]\n{}",
                run.stdout.len(),
                self.compactor
                    .compact("report what the sandboxed program printed", &run.stdout)
                    .await
            )
        } else {
            run.stdout
        };

        let mut content = format!("[exit {}]", run.exit_code);
        if run.timed_out {
            content.push_str(&format!(" [timeout after {}s]", timeout.as_secs()));
        }
        if !stdout.is_empty() {
            content.push_str("\n[stdout]\n");
            content.push_str(&stdout);
        }
        if !run.stderr.is_empty() {
            content.push_str("\n[stderr]\n");
            content.push_str(&run.stderr);
        }

        if run.exit_code == 0 && !run.timed_out {
            ToolOutput::ok(&call.id, content)
        } else {
            ToolOutput::err(&call.id, content)
        }
    }
}

/// Instantiate and run the module on a blocking thread, under the pausable
/// deadline's watchdog.
async fn run_module(
    wasm_path: &Path,
    host: Arc<SandboxHost>,
    deadline: Arc<PausableDeadline>,
    cancel: &tokio_util::sync::CancellationToken,
) -> anyhow::Result<RunOutput> {
    let mut config = Config::new();
    config.epoch_interruption(true);
    let engine = Engine::new(&config)?;
    let module = Module::from_file(&engine, wasm_path)?;

    let mut linker: Linker<HostState> = Linker::new(&engine);
    linker.allow_shadowing(true);
    wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| {
        &mut state.wasi
    })?;
    add_host_imports(&mut linker)?;

    let stdout_pipe = MemoryOutputPipe::new(PIPE_CAPACITY);
    let stderr_pipe = MemoryOutputPipe::new(PIPE_CAPACITY);
    let wasi = WasiCtxBuilder::new()
        .stdout(stdout_pipe.clone())
        .stderr(stderr_pipe.clone())
        .build_p1();

    let mut store = Store::new(&engine, HostState { wasi, host });
    store.set_epoch_deadline(1);
    store.epoch_deadline_trap();

    let _watchdog = deadline.spawn_watchdog(engine.clone());
    // External cancellation traps the module the same way the deadline does.
    let cancel_guard = {
        let engine = engine.clone();
        let deadline = Arc::clone(&deadline);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            deadline.finish();
            engine.increment_epoch();
        })
    };

    let cancelled_flag = cancel.clone();
    let result = tokio::task::spawn_blocking(move || {
        let outcome = (|| -> anyhow::Result<()> {
            let instance = linker.instantiate(&mut store, &module)?;
            let start = instance.get_typed_func::<(), ()>(&mut store, "_start")?;
            start.call(&mut store, ())?;
            Ok(())
        })();
        deadline.finish();

        let exit_code = match outcome {
            Ok(()) => 0,
            Err(e) => {
                if let Some(exit) = e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                    exit.0
                } else if deadline.expired() || cancelled_flag.is_cancelled() {
                    -1
                } else {
                    warn!(error = %e, "sandbox module trapped");
                    -1
                }
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_pipe.contents()).into_owned();
        let mut stderr = String::from_utf8_lossy(&stderr_pipe.contents()).into_owned();
        if deadline.expired() {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str("[execution budget exhausted]");
        } else if cancelled_flag.is_cancelled() {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str("[execution cancelled]");
        }

        RunOutput {
            stdout,
            stderr,
            exit_code,
            timed_out: deadline.expired(),
        }
    })
    .await?;

    cancel_guard.abort();
    Ok(result)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
