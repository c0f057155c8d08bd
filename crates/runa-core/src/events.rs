// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

/// How a progress update should be rendered by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// Append to the transcript as a normal line.
    NoStatus,
    /// Ephemeral spinner text; the next update replaces it.
    JustStatus,
}

/// One progress update streamed from the loop to its consumer.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub message: String,
    pub mode: ReportMode,
    pub ephemeral: bool,
    pub append_newline: bool,
}

impl ProgressUpdate {
    /// Transcript line (persistent).
    pub fn transcript(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            mode: ReportMode::NoStatus,
            ephemeral: false,
            append_newline: true,
        }
    }

    /// Spinner text (replaced by the next update).
    pub fn status(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            mode: ReportMode::JustStatus,
            ephemeral: true,
            append_newline: false,
        }
    }
}

/// Callback receiving progress updates.  Optional everywhere; a loop with no
/// sink runs silently.
pub type ProgressSink = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Deliver an update if a sink is attached.
pub fn report(sink: &Option<ProgressSink>, update: ProgressUpdate) {
    if let Some(sink) = sink {
        sink(update);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn constructors_set_modes() {
        let t = ProgressUpdate::transcript("done");
        assert_eq!(t.mode, ReportMode::NoStatus);
        assert!(!t.ephemeral);
        let s = ProgressUpdate::status("working");
        assert_eq!(s.mode, ReportMode::JustStatus);
        assert!(s.ephemeral);
    }

    #[test]
    fn report_without_sink_is_silent() {
        report(&None, ProgressUpdate::status("x"));
    }

    #[test]
    fn report_delivers_to_sink() {
        let seen: Arc<Mutex<Vec<String>>> = Default::default();
        let seen2 = Arc::clone(&seen);
        let sink: ProgressSink = Arc::new(move |u| seen2.lock().unwrap().push(u.message));
        report(&Some(sink), ProgressUpdate::transcript("hello"));
        assert_eq!(seen.lock().unwrap().as_slice(), ["hello"]);
    }
}
