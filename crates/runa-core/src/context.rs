// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use runa_model::{Message, ModelProvider, Role};
use runa_session::Session;

const SUMMARY_PROMPT: &str = "You are a context compaction assistant. Summarise the \
conversation below in a concise, information-dense way. Preserve technical details, \
decisions, file names, error messages and tool outputs that later work may need. \
The summary replaces the original history.";

/// Token accounting and summary-based compaction of the session history.
pub struct ContextManager {
    summarizer: Arc<dyn ModelProvider>,
    /// Fraction of the model window at which compaction triggers.
    threshold: f32,
    /// Trailing messages preserved verbatim by a compaction.
    keep_recent: usize,
    /// Compactions allowed per rate window.
    max_consecutive: usize,
    window: Duration,
    recent: Mutex<VecDeque<Instant>>,
}

impl ContextManager {
    pub fn new(
        summarizer: Arc<dyn ModelProvider>,
        threshold: f32,
        keep_recent: usize,
        max_consecutive: usize,
        window: Duration,
    ) -> Self {
        Self {
            summarizer,
            threshold: threshold.clamp(0.1, 1.0),
            keep_recent: keep_recent.max(1),
            max_consecutive: max_consecutive.max(1),
            window,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Rough token estimate for a prospective request: the total and the
    /// per-message breakdown.  Monotone in content length; not exact.
    pub fn estimate(system_prompt: &str, messages: &[Arc<Message>]) -> (usize, Vec<usize>) {
        let per_message: Vec<usize> = messages.iter().map(|m| m.approx_tokens()).collect();
        let total = per_message.iter().sum::<usize>() + system_prompt.len() / 4;
        (total, per_message)
    }

    /// True when the estimate exceeds the configured fraction of `window`.
    pub fn should_compact(
        &self,
        context_window: usize,
        system_prompt: &str,
        messages: &[Arc<Message>],
    ) -> bool {
        if context_window == 0 {
            return false;
        }
        let (total, _) = Self::estimate(system_prompt, messages);
        (total as f32) >= (context_window as f32) * self.threshold
    }

    /// Replace the oldest messages with one summary produced by the
    /// secondary model.
    ///
    /// Returns `Ok(true)` when the session head was replaced, `Ok(false)`
    /// when there was nothing to compact or another compaction won the race
    /// (the pointer-gate in [`Session::compact_with_summary`] makes the loser
    /// a no-op).  Errors when the rate limit is hit or the summarizer fails.
    pub async fn compact(&self, session: &Session) -> anyhow::Result<bool> {
        self.admit()?;

        let snapshot = session.snapshot();
        if snapshot.len() <= self.keep_recent + 1 {
            return Ok(false);
        }

        let mut split = snapshot.len() - self.keep_recent;
        // Never split a tool group: a tool-role message at the head of the
        // preserved tail would reference a summarised-away call id, which
        // providers reject.
        while split > 0 && snapshot[split].role == Role::Tool {
            split -= 1;
        }
        if split == 0 {
            return Ok(false);
        }

        let prefix = &snapshot[..split];
        let transcript = render(prefix);
        let summary = self
            .summarizer
            .complete_prompt(&format!("{SUMMARY_PROMPT}\n\n---\n\n{transcript}"))
            .await?;
        if summary.trim().is_empty() {
            anyhow::bail!("summarizer returned an empty summary");
        }

        let applied = session.compact_with_summary(prefix, &summary);
        if applied {
            debug!(replaced = prefix.len(), "session compacted");
        } else {
            warn!("compaction lost the pointer race; no-op");
        }
        Ok(applied)
    }

    /// Sliding-window rate limit on compaction attempts.
    fn admit(&self) -> anyhow::Result<()> {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        while recent.front().is_some_and(|t| now.duration_since(*t) > self.window) {
            recent.pop_front();
        }
        if recent.len() >= self.max_consecutive {
            anyhow::bail!(
                "compaction rejected: {} compactions within {:?}",
                recent.len(),
                self.window
            );
        }
        recent.push_back(now);
        Ok(())
    }
}

/// Plain-text rendering of messages for the summary prompt.
fn render(messages: &[Arc<Message>]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            if m.tool_calls.is_empty() {
                format!("[{role}] {}", m.content)
            } else {
                let calls: Vec<String> = m
                    .tool_calls
                    .iter()
                    .map(|c| format!("{}({})", c.name, c.arguments))
                    .collect();
                format!("[{role}] {} calls: {}", m.content, calls.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_model::ScriptedProvider;

    fn manager(max_consecutive: usize, window: Duration) -> ContextManager {
        let summarizer = Arc::new(
            ScriptedProvider::new(vec![])
                .with_prompt_replies(vec!["the earlier work, condensed".into(); 10]),
        );
        ContextManager::new(summarizer, 0.9, 2, max_consecutive, window)
    }

    fn filled_session(n: usize) -> Session {
        let s = Session::new("/tmp/runa_ctx_test");
        for i in 0..n {
            s.push(Message::user(format!("message number {i}")));
        }
        s
    }

    // ── Estimation ────────────────────────────────────────────────────────────

    #[test]
    fn estimate_is_monotone_in_message_count() {
        let a: Vec<Arc<Message>> = (0..3).map(|i| Arc::new(Message::user(format!("m{i}")))).collect();
        let b: Vec<Arc<Message>> = (0..6).map(|i| Arc::new(Message::user(format!("m{i}")))).collect();
        let (ta, per_a) = ContextManager::estimate("sys", &a);
        let (tb, _) = ContextManager::estimate("sys", &b);
        assert!(tb > ta);
        assert_eq!(per_a.len(), 3);
    }

    #[test]
    fn estimate_counts_system_prompt() {
        let msgs: Vec<Arc<Message>> = vec![Arc::new(Message::user("hello"))];
        let (small, _) = ContextManager::estimate("", &msgs);
        let (large, _) = ContextManager::estimate(&"p".repeat(4_000), &msgs);
        assert!(large >= small + 900);
    }

    #[test]
    fn should_compact_trips_at_threshold() {
        let cm = manager(3, Duration::from_secs(30));
        // Window 100 tokens, threshold 0.9 → trips at ≥ 90 tokens.
        let small: Vec<Arc<Message>> = vec![Arc::new(Message::user("x".repeat(100)))]; // 25 tok
        assert!(!cm.should_compact(100, "", &small));
        let big: Vec<Arc<Message>> = vec![Arc::new(Message::user("x".repeat(400)))]; // 100 tok
        assert!(cm.should_compact(100, "", &big));
    }

    #[test]
    fn zero_window_never_compacts() {
        let cm = manager(3, Duration::from_secs(30));
        let msgs: Vec<Arc<Message>> = vec![Arc::new(Message::user("x".repeat(10_000)))];
        assert!(!cm.should_compact(0, "", &msgs));
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn compact_replaces_head_with_summary() {
        let cm = manager(3, Duration::from_secs(30));
        let s = filled_session(6);
        let applied = cm.compact(&s).await.unwrap();
        assert!(applied);
        let snap = s.snapshot();
        // summary + keep_recent(2)
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].role, Role::System);
        assert!(snap[0].content.contains("condensed"));
        assert_eq!(snap[1].content, "message number 4");
    }

    #[tokio::test]
    async fn compact_skips_tiny_sessions() {
        let cm = manager(3, Duration::from_secs(30));
        let s = filled_session(2);
        assert!(!cm.compact(&s).await.unwrap());
        assert_eq!(s.len(), 2);
    }

    #[tokio::test]
    async fn split_never_strands_tool_results() {
        let cm = manager(3, Duration::from_secs(30));
        let s = Session::new("/tmp/runa_ctx_test");
        for i in 0..4 {
            s.push(Message::user(format!("m{i}")));
        }
        s.push(Message::assistant_with_calls(
            "",
            None,
            vec![runa_model::ToolCallRecord {
                id: "t1".into(),
                name: "shell".into(),
                arguments: "{}".into(),
            }],
        ));
        // keep_recent = 2 would split between the call and its results.
        s.push(Message::tool_result("t1", "shell", "out"));
        s.push(Message::tool_result("t1b", "shell", "out2"));
        let applied = cm.compact(&s).await.unwrap();
        assert!(applied);
        let snap = s.snapshot();
        // The assistant-with-calls message must still precede its results.
        let pos = snap
            .iter()
            .position(|m| !m.tool_calls.is_empty())
            .expect("tool-call message preserved");
        assert_eq!(snap[pos + 1].role, Role::Tool);
    }

    #[tokio::test]
    async fn rate_limit_rejects_fourth_burst_compaction() {
        let cm = manager(3, Duration::from_secs(30));
        for _ in 0..3 {
            let s = filled_session(6);
            cm.compact(&s).await.unwrap();
        }
        let s = filled_session(6);
        let err = cm.compact(&s).await;
        assert!(err.is_err());
        assert!(err.unwrap_err().to_string().contains("rejected"));
    }

    #[tokio::test]
    async fn rate_limit_window_drains() {
        let cm = manager(1, Duration::from_millis(30));
        let s = filled_session(6);
        cm.compact(&s).await.unwrap();
        let s2 = filled_session(6);
        assert!(cm.compact(&s2).await.is_err());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let s3 = filled_session(6);
        assert!(cm.compact(&s3).await.is_ok());
    }

    #[tokio::test]
    async fn stale_prefix_is_noop_ok_false() {
        let cm = manager(5, Duration::from_secs(30));
        let s = filled_session(6);
        // A racing compaction replaces the head between snapshot and apply —
        // simulated by compacting twice; the second run sees a fresh snapshot,
        // so instead exercise the gate directly.
        let stale = s.snapshot()[..3].to_vec();
        assert!(s.compact_with_summary(&stale, "winner"));
        assert!(!s.compact_with_summary(&stale, "loser"));
    }
}
