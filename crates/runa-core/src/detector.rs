// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

/// Default rolling window over normalized text.
const DEFAULT_WINDOW_BYTES: usize = 32 * 1024;

/// How many observations of one fingerprint flag a loop.
const DEFAULT_THRESHOLD: usize = 4;

/// Fingerprint length bounds (normalized chars).  Shorter fragments repeat
/// legitimately all the time (list bullets, header lines in code output);
/// longer ones are clamped so near-identical paragraphs hash together.
const MIN_PATTERN_LEN: usize = 40;
const MAX_PATTERN_LEN: usize = 200;

/// Result of feeding one chunk to the detector.
#[derive(Debug, Clone)]
pub struct Detection {
    pub is_loop: bool,
    pub pattern: String,
    pub count: usize,
}

impl Detection {
    fn none() -> Self {
        Self {
            is_loop: false,
            pattern: String::new(),
            count: 0,
        }
    }
}

struct Entry {
    key: u64,
    len: usize,
}

/// Rolling-window repetition detector over assistant output.
///
/// Each added chunk is split into paragraphs, normalized (whitespace
/// collapsed, case folded) and fingerprinted.  A fingerprint observed
/// `threshold` times within the byte window flags a loop.  The caller
/// depends only on the signal, not on the exact fingerprinting.
pub struct LoopDetector {
    window_bytes: usize,
    threshold: usize,
    entries: VecDeque<Entry>,
    counts: HashMap<u64, usize>,
    samples: HashMap<u64, String>,
    total_bytes: usize,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_WINDOW_BYTES)
    }
}

impl LoopDetector {
    pub fn new(threshold: usize, window_bytes: usize) -> Self {
        Self {
            window_bytes,
            threshold: threshold.max(2),
            entries: VecDeque::new(),
            counts: HashMap::new(),
            samples: HashMap::new(),
            total_bytes: 0,
        }
    }

    /// Change the rolling window size; existing observations are kept and
    /// trimmed to the new bound.
    pub fn set_window_bytes(&mut self, bytes: usize) {
        self.window_bytes = bytes;
        self.evict();
    }

    pub fn window_bytes(&self) -> usize {
        self.window_bytes
    }

    /// Drop all observations.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.counts.clear();
        self.samples.clear();
        self.total_bytes = 0;
    }

    /// Feed one chunk (typically one assistant turn) and report whether any
    /// fingerprint has now been seen `threshold` times within the window.
    pub fn add(&mut self, text: &str) -> Detection {
        let mut added: Vec<u64> = Vec::new();
        for candidate in candidates(text) {
            let key = fingerprint(&candidate);
            *self.counts.entry(key).or_insert(0) += 1;
            self.samples.entry(key).or_insert_with(|| candidate.clone());
            self.entries.push_back(Entry {
                key,
                len: candidate.len(),
            });
            self.total_bytes += candidate.len();
            added.push(key);
        }

        // Trim to the window first so observations that just slid out do not
        // count toward this chunk's verdict.
        self.evict();

        let mut best = Detection::none();
        for key in added {
            if let Some(&count) = self.counts.get(&key) {
                if count >= self.threshold && count > best.count {
                    best = Detection {
                        is_loop: true,
                        pattern: self.samples.get(&key).cloned().unwrap_or_default(),
                        count,
                    };
                }
            }
        }
        best
    }

    fn evict(&mut self) {
        while self.total_bytes > self.window_bytes {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            self.total_bytes -= entry.len;
            if let Some(c) = self.counts.get_mut(&entry.key) {
                *c -= 1;
                if *c == 0 {
                    self.counts.remove(&entry.key);
                    self.samples.remove(&entry.key);
                }
            }
        }
    }
}

/// Normalized fingerprint candidates for one chunk: each paragraph long
/// enough to be meaningful, or the whole chunk when it has no long
/// paragraphs but is itself long enough.
fn candidates(text: &str) -> Vec<String> {
    let mut out: Vec<String> = text
        .split("\n\n")
        .map(normalize)
        .filter(|p| p.len() >= MIN_PATTERN_LEN)
        .map(|p| clamp(&p))
        .collect();
    if out.is_empty() {
        let whole = normalize(text);
        if whole.len() >= MIN_PATTERN_LEN {
            out.push(clamp(&whole));
        }
    }
    out
}

/// Collapse all whitespace runs to single spaces and fold case.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn clamp(s: &str) -> String {
    s.chars().take(MAX_PATTERN_LEN).collect()
}

fn fingerprint(s: &str) -> u64 {
    let mut h = DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
