// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use runa_config::RetryConfig;

use crate::provider::{is_transient_error, ModelProvider};
use crate::{CompletionRequest, CompletionResponse};

/// Call the provider with exponential backoff on transient failures.
///
/// Attempt N (1-based) waits `base * 2^(N-1)` before retrying, capped at the
/// configured ceiling.  Permanent errors and an exhausted budget surface the
/// last error; cancellation aborts immediately, both between attempts and
/// during the backoff sleep.
pub async fn complete_with_retry(
    provider: &dyn ModelProvider,
    req: &CompletionRequest,
    cfg: &RetryConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<CompletionResponse> {
    let max_attempts = cfg.max_attempts.max(1);
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            anyhow::bail!("completion cancelled");
        }

        match provider.complete(req.clone()).await {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                if !is_transient_error(&e) || attempt == max_attempts {
                    return Err(e).context("model completion failed");
                }
                let delay = backoff_delay(cfg, attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    error = %e,
                    "transient model failure; backing off"
                );
                last_err = Some(e);
                tokio::select! {
                    _ = cancel.cancelled() => anyhow::bail!("completion cancelled during backoff"),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry budget exhausted")))
}

/// Delay before the retry following attempt `attempt` (1-based).
pub fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let ms = cfg.base_delay_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(ms).min(Duration::from_secs(cfg.max_delay_secs))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
