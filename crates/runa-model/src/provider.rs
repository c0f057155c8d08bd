// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use thiserror::Error;

use crate::{CompletionRequest, CompletionResponse, Message};

/// Typed provider failures.
///
/// The retry layer only needs the transient/permanent distinction; everything
/// else flows through as `anyhow::Error` context.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    Other(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Unavailable(_) | Self::Timeout(_)
        )
    }
}

/// Classify an error as retryable.
///
/// A typed [`ModelError`] in the chain is authoritative.  For errors that
/// arrive as plain text (driver-specific bodies, proxy responses), fall back
/// to the conventional markers: HTTP 429, timeouts, 5xx status codes, and
/// the "overloaded" substring some providers put in error bodies.
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    if let Some(me) = err.downcast_ref::<ModelError>() {
        return me.is_transient();
    }
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("429")
        || msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("overloaded")
        || msg.contains("status 500")
        || msg.contains("status 502")
        || msg.contains("status 503")
        || msg.contains("status 504")
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name used for rate-limit configuration lookup.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Context window of the configured model, in tokens.
    fn context_window(&self) -> usize;

    /// Send one completion request and return the full response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<CompletionResponse>;

    /// One-shot text completion used by the compactor and the judge.
    ///
    /// The default implementation wraps `prompt` into a single user message
    /// with no tools.
    async fn complete_prompt(&self, prompt: &str) -> anyhow::Result<String> {
        let req = CompletionRequest {
            messages: vec![std::sync::Arc::new(Message::user(prompt))],
            ..Default::default()
        };
        let resp = self.complete(req).await?;
        Ok(resp.content)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_transient_errors_are_retryable() {
        assert!(ModelError::RateLimited("slow down".into()).is_transient());
        assert!(ModelError::Unavailable("503".into()).is_transient());
        assert!(ModelError::Timeout("30s".into()).is_transient());
        assert!(!ModelError::Other("bad request".into()).is_transient());
    }

    #[test]
    fn typed_error_in_chain_is_authoritative() {
        let err = anyhow::Error::new(ModelError::Other("contains 429 but permanent".into()));
        assert!(!is_transient_error(&err));
    }

    #[test]
    fn string_markers_classify_as_transient() {
        for msg in [
            "HTTP 429 too many requests",
            "connection timed out",
            "upstream status 503",
            "model is overloaded, try later",
        ] {
            let err = anyhow::anyhow!("{msg}");
            assert!(is_transient_error(&err), "{msg} should be transient");
        }
    }

    #[test]
    fn plain_errors_are_permanent() {
        let err = anyhow::anyhow!("invalid api key");
        assert!(!is_transient_error(&err));
    }
}
