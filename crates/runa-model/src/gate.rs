// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use runa_config::ProviderLimits;

/// Outbound request shaping for one provider: a minimum interval between
/// requests plus a prompt-token bucket.
///
/// The effective interval is `max(min_interval_ms, 60000 / requests_per_minute)`.
/// The bucket refills at `tokens_per_minute / 60` per second with capacity
/// `tokens_per_minute`; `tokens_per_minute = 0` disables token shaping but
/// leaves interval shaping intact.
pub struct RateLimitGate {
    interval: Duration,
    tokens_per_minute: u32,
    state: tokio::sync::Mutex<GateState>,
}

struct GateState {
    last_sent: Option<Instant>,
    bucket: f64,
    last_refill: Instant,
}

impl RateLimitGate {
    pub fn new(limits: ProviderLimits) -> Self {
        let rpm_interval = if limits.requests_per_minute > 0 {
            Duration::from_millis(60_000 / limits.requests_per_minute as u64)
        } else {
            Duration::ZERO
        };
        let interval = rpm_interval.max(Duration::from_millis(limits.min_interval_ms));
        Self {
            interval,
            tokens_per_minute: limits.tokens_per_minute,
            state: tokio::sync::Mutex::new(GateState {
                last_sent: None,
                bucket: limits.tokens_per_minute as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Effective minimum interval between requests.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until both the interval and the token budget admit a request
    /// estimated at `prompt_tokens`, then commit both atomically.
    ///
    /// Returns an error promptly when `cancel` fires during any wait.
    pub async fn acquire(
        &self,
        prompt_tokens: usize,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        // An estimate above bucket capacity would never be admitted; clamp so
        // oversized prompts pay the full bucket instead of deadlocking.
        let cost = if self.tokens_per_minute > 0 {
            (prompt_tokens as f64).min(self.tokens_per_minute as f64)
        } else {
            0.0
        };

        loop {
            let wait = {
                let mut st = self.state.lock().await;
                let now = Instant::now();

                // Refill the bucket for the elapsed time.
                if self.tokens_per_minute > 0 {
                    let elapsed = now.duration_since(st.last_refill).as_secs_f64();
                    let rate = self.tokens_per_minute as f64 / 60.0;
                    st.bucket = (st.bucket + elapsed * rate).min(self.tokens_per_minute as f64);
                    st.last_refill = now;
                }

                let interval_wait = match st.last_sent {
                    Some(t) => (t + self.interval).duration_since(now),
                    None => Duration::ZERO,
                };

                let token_wait = if cost > 0.0 && st.bucket < cost {
                    let missing = cost - st.bucket;
                    let rate = self.tokens_per_minute as f64 / 60.0;
                    Duration::from_secs_f64(missing / rate)
                } else {
                    Duration::ZERO
                };

                let wait = interval_wait.max(token_wait);
                if wait.is_zero() {
                    // Commit: both constraints satisfied under the same lock.
                    st.last_sent = Some(now);
                    st.bucket -= cost;
                    return Ok(());
                }
                wait
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate-limit gate waiting");
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("rate-limit wait cancelled"),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Registry of gates, one per provider.
///
/// This is the single process-wide piece of rate-limit state; it is created
/// once from the config and shared by `Arc`.  Providers without configured
/// limits get a pass-through gate.
pub struct RateLimitGates {
    limits: HashMap<String, ProviderLimits>,
    gates: std::sync::Mutex<HashMap<String, Arc<RateLimitGate>>>,
}

impl RateLimitGates {
    pub fn new(limits: HashMap<String, ProviderLimits>) -> Self {
        Self {
            limits,
            gates: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The gate for `provider`, created on first use.
    pub fn gate_for(&self, provider: &str) -> Arc<RateLimitGate> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(g) = gates.get(provider) {
            return Arc::clone(g);
        }
        let limits = self.limits.get(provider).copied().unwrap_or_default();
        let gate = Arc::new(RateLimitGate::new(limits));
        gates.insert(provider.to_string(), Arc::clone(&gate));
        gate
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
