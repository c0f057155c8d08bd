// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

/// Synchronous (from the caller's view) user prompt channel.
///
/// Implementations may block for arbitrarily long; callers that run under a
/// deadline are expected to pause it while a prompt is pending.
#[async_trait]
pub trait UserInteraction: Send + Sync {
    /// Ask a question; `options` offers a multiple-choice list when present.
    /// Returns the user's answer text.
    async fn ask(&self, question: &str, options: Option<&[String]>) -> anyhow::Result<String>;
}

/// Interaction stub for CI and tests: every prompt fails, so callers fall
/// back to their `requires_user_input` path instead of hanging.
pub struct HeadlessInteraction;

#[async_trait]
impl UserInteraction for HeadlessInteraction {
    async fn ask(&self, question: &str, _options: Option<&[String]>) -> anyhow::Result<String> {
        anyhow::bail!("no interactive user available to answer: {question}")
    }
}

/// Reads answers from stdin.  Used by the headful CLI.
pub struct TerminalInteraction;

#[async_trait]
impl UserInteraction for TerminalInteraction {
    async fn ask(&self, question: &str, options: Option<&[String]>) -> anyhow::Result<String> {
        use tokio::io::AsyncBufReadExt;

        eprintln!();
        eprintln!("── question ──────────────────────────────────────");
        eprintln!("{question}");
        if let Some(opts) = options {
            for (i, opt) in opts.iter().enumerate() {
                eprintln!("  {}. {}", i + 1, opt);
            }
        }
        eprint!("> ");

        let mut line = String::new();
        let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
        reader.read_line(&mut line).await?;
        let answer = line.trim().to_string();

        // A bare number selects the corresponding option.
        if let (Some(opts), Ok(n)) = (options, answer.parse::<usize>()) {
            if n >= 1 && n <= opts.len() {
                return Ok(opts[n - 1].clone());
            }
        }
        Ok(answer)
    }
}

/// Scripted interaction for tests: pops queued answers and records every
/// question asked.
pub struct ScriptedInteraction {
    answers: Mutex<VecDeque<String>>,
    questions: Mutex<Vec<String>>,
}

impl ScriptedInteraction {
    pub fn new(answers: Vec<String>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            questions: Mutex::new(Vec::new()),
        }
    }

    pub fn questions_asked(&self) -> Vec<String> {
        self.questions.lock().unwrap().clone()
    }
}

#[async_trait]
impl UserInteraction for ScriptedInteraction {
    async fn ask(&self, question: &str, _options: Option<&[String]>) -> anyhow::Result<String> {
        self.questions.lock().unwrap().push(question.to_string());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted answers exhausted"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
