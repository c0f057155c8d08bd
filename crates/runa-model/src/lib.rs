// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod compactor;
mod gate;
mod mock;
mod openai_compat;
mod provider;
mod retry;
mod types;

pub use compactor::OutputCompactor;
pub use gate::{RateLimitGate, RateLimitGates};
pub use mock::ScriptedProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{is_transient_error, ModelError, ModelProvider};
pub use retry::{backoff_delay, complete_with_retry};
pub use types::{
    normalize_tool_call_ids, CompletionRequest, CompletionResponse, Message, Role, StopReason,
    ToolCallRecord, ToolSchema,
};

use runa_config::ModelConfig;
use std::sync::Arc;

/// Build a provider from its configuration.
pub fn provider_from_config(cfg: &ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "openai" | "openai_compat" => Ok(Arc::new(OpenAiCompatProvider::from_config(cfg)?)),
        "mock" => Ok(Arc::new(ScriptedProvider::always_text("mock reply"))),
        other => anyhow::bail!("unknown model provider: {other}"),
    }
}
