// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

const DEFAULT_RESULT_CAP: usize = 100;

/// Directories that are never worth searching.
fn is_excluded(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|n| n == ".git" || n == "target" || n == "node_modules")
}

/// Convert a shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── search_files ─────────────────────────────────────────────────────────────

/// Glob search over file paths under the session root.
pub struct SearchFilesTool {
    pub result_cap: usize,
}

impl Default for SearchFilesTool {
    fn default() -> Self {
        Self {
            result_cap: DEFAULT_RESULT_CAP,
        }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Find files whose name matches a glob pattern (* and ? wildcards). \
         Searches recursively from the session root; .git/, target/ and \
         node_modules/ are skipped. Results are capped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern matched against file names, e.g. '*.rs'"
                },
                "root": {
                    "type": "string",
                    "description": "Subdirectory to search from (default: session root)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(pattern) = call.args.get("pattern").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required parameter 'pattern'");
        };
        let Some(re) = glob_to_regex(pattern) else {
            return ToolOutput::err(&call.id, format!("invalid glob pattern: {pattern}"));
        };
        let root = match call.args.get("root").and_then(|v| v.as_str()) {
            Some(sub) => match ctx.session.resolve_path(sub) {
                Ok(p) => p,
                Err(e) => return ToolOutput::err(&call.id, e.to_string()),
            },
            None => ctx.session.root().to_path_buf(),
        };

        debug!(pattern, root = %root.display(), "search_files tool");

        let mut matches: Vec<String> = Vec::new();
        let mut truncated = false;
        for entry in WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| !is_excluded(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy();
            if re.is_match(&name) {
                if matches.len() >= self.result_cap {
                    truncated = true;
                    break;
                }
                let shown = entry
                    .path()
                    .strip_prefix(ctx.session.root())
                    .unwrap_or(entry.path());
                matches.push(shown.display().to_string());
            }
        }

        if matches.is_empty() {
            return ToolOutput::ok(&call.id, format!("no files match {pattern}"));
        }
        matches.sort();
        let mut out = matches.join("\n");
        if truncated {
            out.push_str(&format!("\n[capped at {} results]", self.result_cap));
        }
        ToolOutput::ok(&call.id, out)
    }
}

// ─── search_file_content ──────────────────────────────────────────────────────

/// Regex search over file contents under the session root.
pub struct SearchFileContentTool {
    pub result_cap: usize,
}

impl Default for SearchFileContentTool {
    fn default() -> Self {
        Self {
            result_cap: DEFAULT_RESULT_CAP,
        }
    }
}

#[async_trait]
impl Tool for SearchFileContentTool {
    fn name(&self) -> &str {
        "search_file_content"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Matches are returned \
         as path:line: text. include: optional glob filter on file names. \
         Results are capped; binary files are skipped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "root": {
                    "type": "string",
                    "description": "Subdirectory to search from (default: session root)"
                },
                "include": {
                    "type": "string",
                    "description": "Glob filter on file names, e.g. '*.rs'"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(pattern) = call.args.get("pattern").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required parameter 'pattern'");
        };
        let re = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid regex: {e}")),
        };
        let include = call
            .args
            .get("include")
            .and_then(|v| v.as_str())
            .and_then(glob_to_regex);
        let root = match call.args.get("root").and_then(|v| v.as_str()) {
            Some(sub) => match ctx.session.resolve_path(sub) {
                Ok(p) => p,
                Err(e) => return ToolOutput::err(&call.id, e.to_string()),
            },
            None => ctx.session.root().to_path_buf(),
        };

        debug!(pattern, root = %root.display(), "search_file_content tool");

        let mut matches: Vec<String> = Vec::new();
        let mut truncated = false;
        'files: for entry in WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_excluded(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if let Some(inc) = &include {
                let name = entry.file_name().to_string_lossy();
                if !inc.is_match(&name) {
                    continue;
                }
            }
            let Ok(bytes) = std::fs::read(entry.path()) else {
                continue;
            };
            if bytes.contains(&0u8) {
                continue; // binary
            }
            let text = String::from_utf8_lossy(&bytes);
            let shown = entry
                .path()
                .strip_prefix(ctx.session.root())
                .unwrap_or(entry.path())
                .display()
                .to_string();
            for (lineno, line) in text.lines().enumerate() {
                if re.is_match(line) {
                    if matches.len() >= self.result_cap {
                        truncated = true;
                        break 'files;
                    }
                    matches.push(format!("{shown}:{}: {}", lineno + 1, line.trim_end()));
                }
            }
        }

        if matches.is_empty() {
            return ToolOutput::ok(&call.id, format!("no matches for {pattern}"));
        }
        let mut out = matches.join("\n");
        if truncated {
            out.push_str(&format!("\n[capped at {} matches]", self.result_cap));
        }
        ToolOutput::ok(&call.id, out)
    }
}

// ─── codebase_investigator ────────────────────────────────────────────────────

/// Structural overview of the session root: directory tree, file counts by
/// extension, and the head of obvious entry documents.  Used by the planning
/// loop to orient before asking questions.
pub struct CodebaseInvestigatorTool;

#[async_trait]
impl Tool for CodebaseInvestigatorTool {
    fn name(&self) -> &str {
        "codebase_investigator"
    }

    fn description(&self) -> &str {
        "Summarise the project layout: top-level entries, file counts by \
         extension, and the first lines of README/manifest files. Use this \
         before planning to orient in an unfamiliar codebase."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "depth": {
                    "type": "integer",
                    "description": "Directory depth to list (default 2)"
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let depth = call.args.get("depth").and_then(|v| v.as_u64()).unwrap_or(2) as usize;
        let root = ctx.session.root().to_path_buf();

        let mut tree: Vec<String> = Vec::new();
        let mut ext_counts: std::collections::BTreeMap<String, usize> = Default::default();
        for entry in WalkDir::new(&root)
            .max_depth(depth.clamp(1, 6))
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_excluded(e))
            .filter_map(|e| e.ok())
        {
            if entry.depth() == 0 {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .display()
                .to_string();
            if tree.len() < 200 {
                let marker = if entry.file_type().is_dir() { "/" } else { "" };
                tree.push(format!("{}{marker}", rel));
            }
            if entry.file_type().is_file() {
                let ext = entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("(none)")
                    .to_string();
                *ext_counts.entry(ext).or_default() += 1;
            }
        }

        let mut report = String::new();
        report.push_str("## Layout\n");
        report.push_str(&tree.join("\n"));
        report.push_str("\n\n## Files by extension\n");
        for (ext, n) in &ext_counts {
            report.push_str(&format!("{ext}: {n}\n"));
        }

        for doc in ["README.md", "README", "Cargo.toml", "package.json", "go.mod"] {
            let p = root.join(doc);
            if let Ok(text) = tokio::fs::read_to_string(&p).await {
                let head: String = text.lines().take(30).collect::<Vec<_>>().join("\n");
                report.push_str(&format!("\n## {doc} (head)\n{head}\n"));
                ctx.session.track_file_read(p, text);
            }
        }

        ToolOutput::ok(&call.id, report)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use runa_session::{Authorizer, ScriptedInteraction, Session};

    fn ctx_in(dir: &std::path::Path) -> ToolContext {
        let session = Arc::new(Session::new(dir));
        let ui = Arc::new(ScriptedInteraction::new(vec![]));
        let auth = Arc::new(Authorizer::new(Arc::clone(&session), ui.clone()));
        ToolContext::new(session, auth, ui)
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: name.into(),
            args,
        }
    }

    fn seed(dir: &std::path::Path) {
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("src/main.rs"), "fn main() {\n    run();\n}\n").unwrap();
        std::fs::write(dir.join("src/lib.rs"), "pub fn run() {}\n").unwrap();
        std::fs::write(dir.join("notes.txt"), "remember the milk\n").unwrap();
    }

    // ── search_files ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn glob_finds_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let ctx = ctx_in(dir.path());
        let out = SearchFilesTool::default()
            .execute(&ctx, &call("search_files", json!({"pattern": "*.rs"})))
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("src/main.rs"));
        assert!(out.content.contains("src/lib.rs"));
        assert!(!out.content.contains("notes.txt"));
    }

    #[tokio::test]
    async fn glob_without_matches_reports_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let ctx = ctx_in(dir.path());
        let out = SearchFilesTool::default()
            .execute(&ctx, &call("search_files", json!({"pattern": "*.zig"})))
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("no files match"));
    }

    #[tokio::test]
    async fn result_cap_truncates_file_list() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            std::fs::write(dir.path().join(format!("f{i}.log")), "x").unwrap();
        }
        let ctx = ctx_in(dir.path());
        let tool = SearchFilesTool { result_cap: 5 };
        let out = tool
            .execute(&ctx, &call("search_files", json!({"pattern": "*.log"})))
            .await;
        assert!(out.content.contains("capped at 5"));
        assert_eq!(out.content.lines().filter(|l| l.ends_with(".log")).count(), 5);
    }

    // ── search_file_content ───────────────────────────────────────────────────

    #[tokio::test]
    async fn content_search_reports_path_line_text() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let ctx = ctx_in(dir.path());
        let out = SearchFileContentTool::default()
            .execute(
                &ctx,
                &call("search_file_content", json!({"pattern": "fn main"})),
            )
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("src/main.rs:1: fn main() {"));
    }

    #[tokio::test]
    async fn include_filter_restricts_files() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        std::fs::write(dir.path().join("other.txt"), "fn main in prose\n").unwrap();
        let ctx = ctx_in(dir.path());
        let out = SearchFileContentTool::default()
            .execute(
                &ctx,
                &call(
                    "search_file_content",
                    json!({"pattern": "fn main", "include": "*.rs"}),
                ),
            )
            .await;
        assert!(out.content.contains("src/main.rs"));
        assert!(!out.content.contains("other.txt"));
    }

    #[tokio::test]
    async fn invalid_regex_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        let out = SearchFileContentTool::default()
            .execute(&ctx, &call("search_file_content", json!({"pattern": "(["})))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("invalid regex"));
    }

    // ── codebase_investigator ─────────────────────────────────────────────────

    #[tokio::test]
    async fn investigator_reports_layout_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        std::fs::write(dir.path().join("README.md"), "# Demo project\n").unwrap();
        let ctx = ctx_in(dir.path());
        let out = CodebaseInvestigatorTool
            .execute(&ctx, &call("codebase_investigator", json!({})))
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("src/"));
        assert!(out.content.contains("rs: 2"));
        assert!(out.content.contains("# Demo project"));
    }

    // ── glob helper ───────────────────────────────────────────────────────────

    #[test]
    fn glob_star_and_question_mark() {
        let re = glob_to_regex("*.rs").unwrap();
        assert!(re.is_match("main.rs"));
        assert!(!re.is_match("main.rb"));
        let re = glob_to_regex("f?.log").unwrap();
        assert!(re.is_match("f1.log"));
        assert!(!re.is_match("f12.log"));
    }
}
