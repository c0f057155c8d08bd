// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tracing::warn;

use crate::ModelProvider;

/// Fraction of the summarizer's context window one chunk may occupy.
const DEFAULT_CHUNK_FRACTION: f32 = 0.7;

/// Summary-merges oversize tool output through a secondary model.
///
/// The input is split into chunks sized to the summarizer's window, each
/// chunk is summarised toward the caller's goal, and a final pass merges the
/// partials.  Failures degrade: a failed chunk keeps a placeholder naming the
/// dropped range, and a failed merge returns the concatenated partials.  The
/// caller never silently loses the fact that output existed.
pub struct OutputCompactor {
    summarizer: Arc<dyn ModelProvider>,
    chunk_fraction: f32,
}

impl OutputCompactor {
    pub fn new(summarizer: Arc<dyn ModelProvider>) -> Self {
        Self {
            summarizer,
            chunk_fraction: DEFAULT_CHUNK_FRACTION,
        }
    }

    pub fn with_chunk_fraction(mut self, fraction: f32) -> Self {
        self.chunk_fraction = fraction.clamp(0.1, 0.9);
        self
    }

    /// Chunk size in characters (4 chars ≈ 1 token).
    fn chunk_chars(&self) -> usize {
        let window_tokens = self.summarizer.context_window().max(1024);
        ((window_tokens as f32 * self.chunk_fraction) as usize * 4).max(1024)
    }

    /// Summarise `text` toward `goal`.
    pub async fn compact(&self, goal: &str, text: &str) -> String {
        let chunks = split_chunks(text, self.chunk_chars());
        let total = chunks.len();

        let mut partials: Vec<String> = Vec::with_capacity(total);
        for (i, chunk) in chunks.iter().enumerate() {
            let prompt = format!(
                "Summarise this output chunk ({} of {total}) toward the goal: {goal}\n\
                 Preserve exact values, paths, error messages and counts.\n\n{chunk}",
                i + 1
            );
            match self.summarizer.complete_prompt(&prompt).await {
                Ok(s) if !s.is_empty() => partials.push(s),
                Ok(_) | Err(_) => {
                    warn!(chunk = i + 1, total, "chunk summarisation failed");
                    partials.push(format!(
                        "[chunk {} of {total} ({} bytes) could not be summarised]",
                        i + 1,
                        chunk.len()
                    ));
                }
            }
        }

        if partials.len() == 1 {
            return partials.into_iter().next().unwrap_or_default();
        }

        let joined = partials.join("\n\n");
        let merge_prompt = format!(
            "Combine these {total} partial summaries into one coherent summary \
             toward the goal: {goal}\n\n{joined}"
        );
        match self.summarizer.complete_prompt(&merge_prompt).await {
            Ok(s) if !s.is_empty() => s,
            Ok(_) | Err(_) => {
                warn!("summary merge failed; returning partial summaries");
                joined
            }
        }
    }
}

/// Split on char boundaries into chunks of at most `max_chars` characters.
fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let mut chunks = Vec::new();
    let mut current = String::with_capacity(max_chars.min(text.len()));
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
