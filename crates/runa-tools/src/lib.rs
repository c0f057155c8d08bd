// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
mod registry;
mod tool;

pub use registry::ToolRegistry;
pub use tool::{Tool, ToolCall, ToolContext, ToolOutput};

pub use builtin::ask_user::{AskUserMultipleTool, AskUserTool};
pub use builtin::fs_ops::{CreateFileTool, MkdirTool, MoveTool, RemoveFileTool, WriteFileTool};
pub use builtin::programs::{StatusProgramTool, StopProgramTool, WaitProgramTool};
pub use builtin::read_file::ReadFileTool;
pub use builtin::search::{CodebaseInvestigatorTool, SearchFileContentTool, SearchFilesTool};
pub use builtin::shell::ShellTool;
pub use builtin::web_fetch::WebFetchTool;

use runa_config::ToolsConfig;

/// Register the full built-in tool set with `cfg`-derived knobs.
pub fn register_builtin(registry: &ToolRegistry, cfg: &ToolsConfig) {
    registry.register(ReadFileTool {
        line_cap: cfg.read_line_cap,
    });
    registry.register(WriteFileTool);
    registry.register(CreateFileTool);
    registry.register(RemoveFileTool);
    registry.register(MkdirTool);
    registry.register(MoveTool);
    registry.register(SearchFilesTool {
        result_cap: cfg.search_result_cap,
    });
    registry.register(SearchFileContentTool {
        result_cap: cfg.search_result_cap,
    });
    registry.register(CodebaseInvestigatorTool);
    registry.register(ShellTool {
        timeout_secs: cfg.shell_timeout_secs,
        timeout_max_secs: cfg.shell_timeout_max_secs,
    });
    registry.register(StatusProgramTool);
    registry.register(WaitProgramTool);
    registry.register(StopProgramTool);
    registry.register(AskUserTool);
    registry.register(AskUserMultipleTool);
    registry.register(WebFetchTool::default());
}

/// Tool names available to the planning loop.
pub const PLANNING_TOOLS: &[&str] = &[
    "ask_user",
    "ask_user_multiple",
    "read_file",
    "search_files",
    "search_file_content",
    "codebase_investigator",
];

// ─── Unit tests ──────────────────────────────────────────────────────────────
