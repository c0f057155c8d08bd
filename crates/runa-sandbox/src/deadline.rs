// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A deadline that can be suspended while the sandbox waits on a human.
///
/// The budget is counted in watchdog ticks.  While paused, ticks do not
/// consume the budget, so an authorization prompt that takes minutes leaves
/// the program's remaining time untouched.  When the budget reaches zero the
/// watchdog bumps the wasmtime epoch, which traps the running module.
pub struct PausableDeadline {
    remaining_ticks: AtomicU64,
    paused: AtomicBool,
    expired: AtomicBool,
    finished: AtomicBool,
    tick: Duration,
}

impl PausableDeadline {
    pub fn new(budget: Duration, tick: Duration) -> Arc<Self> {
        let ticks = (budget.as_millis() / tick.as_millis().max(1)).max(1) as u64;
        Arc::new(Self {
            remaining_ticks: AtomicU64::new(ticks),
            paused: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            tick,
        })
    }

    /// Stop consuming budget (user interaction pending).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume consuming budget.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    pub fn remaining_ticks(&self) -> u64 {
        self.remaining_ticks.load(Ordering::SeqCst)
    }

    /// Mark the guarded execution as done; the watchdog thread exits.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    /// One watchdog step.  Returns `true` when the watchdog should keep
    /// running.  Split out from the thread loop so the accounting is
    /// testable without real time.
    pub fn step(&self) -> bool {
        if self.finished.load(Ordering::SeqCst) {
            return false;
        }
        if self.paused.load(Ordering::SeqCst) {
            return true;
        }
        let left = self.remaining_ticks.load(Ordering::SeqCst);
        if left == 0 {
            self.expired.store(true, Ordering::SeqCst);
            return false;
        }
        self.remaining_ticks.store(left - 1, Ordering::SeqCst);
        true
    }

    /// Run the watchdog on its own thread, trapping `engine`'s stores when
    /// the budget runs dry.
    pub fn spawn_watchdog(self: &Arc<Self>, engine: wasmtime::Engine) -> std::thread::JoinHandle<()> {
        let deadline = Arc::clone(self);
        let tick = deadline.tick;
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(tick);
                if !deadline.step() {
                    break;
                }
            }
            if deadline.expired() {
                engine.increment_epoch();
            }
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
