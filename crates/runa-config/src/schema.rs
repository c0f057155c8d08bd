// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    /// Secondary model used for compaction summaries, the output compactor
    /// and the continue/stop judge.  Falls back to `model` when unset.
    #[serde(default)]
    pub summarizer: Option<ModelConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-provider request shaping, keyed by provider name.
    ///
    /// ```yaml
    /// limits:
    ///   openai:
    ///     requests_per_minute: 60
    ///     tokens_per_minute: 90000
    ///   anthropic:
    ///     min_interval_ms: 500
    /// ```
    #[serde(default)]
    pub limits: HashMap<String, ProviderLimits>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" | "openai_compat" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies, LiteLLM, or Cloudflare.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Context window override.  When unset the driver's default for the
    /// model name is used.
    pub context_window: Option<u32>,
    /// Attach a cache-control marker to the stable prompt prefix for
    /// providers that support explicit prompt caching.
    #[serde(default = "default_true")]
    pub cache_prompt_prefix: bool,
    /// Cache TTL hint forwarded to providers that accept one (e.g. "5m", "1h").
    pub cache_ttl: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            api_key_env: Some("OPENAI_API_KEY".into()),
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            context_window: None,
            cache_prompt_prefix: true,
            cache_ttl: None,
        }
    }
}

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

// ─── Agent ────────────────────────────────────────────────────────────────────

/// Which termination strategy drives the orchestrator loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Default,
    /// Half the iteration and auto-continue budgets; compacts earlier;
    /// stops on any non-continue outcome.
    Conservative,
    /// Double budgets; auto-continue always enabled.
    Aggressive,
    /// Default predicates plus a small-model continue/stop judge.
    Judge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard ceiling on loop iterations per run.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Tighter ceiling used by the planning loop.
    #[serde(default = "default_planning_max_iterations")]
    pub planning_max_iterations: u32,
    /// How many times a run may auto-continue after truncated-looking output.
    #[serde(default = "default_auto_continue_max_attempts")]
    pub auto_continue_max_attempts: u32,
    /// Fraction of the context window at which compaction triggers.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// How many trailing messages survive a compaction verbatim.
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
    /// Compactions allowed inside one rate window before further requests
    /// are rejected.
    #[serde(default = "default_max_consecutive_compactions")]
    pub max_consecutive_compactions: usize,
    /// Length of the compaction rate window, seconds.
    #[serde(default = "default_compaction_window_secs")]
    pub compaction_window_secs: u64,
    #[serde(default)]
    pub strategy: StrategyKind,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            planning_max_iterations: default_planning_max_iterations(),
            auto_continue_max_attempts: default_auto_continue_max_attempts(),
            compaction_threshold: default_compaction_threshold(),
            compaction_keep_recent: default_compaction_keep_recent(),
            max_consecutive_compactions: default_max_consecutive_compactions(),
            compaction_window_secs: default_compaction_window_secs(),
            strategy: StrategyKind::Default,
        }
    }
}

fn default_max_iterations() -> u32 {
    256
}
fn default_planning_max_iterations() -> u32 {
    96
}
fn default_auto_continue_max_attempts() -> u32 {
    3
}
fn default_compaction_threshold() -> f32 {
    0.9
}
fn default_compaction_keep_recent() -> usize {
    8
}
fn default_max_consecutive_compactions() -> usize {
    3
}
fn default_compaction_window_secs() -> u64 {
    30
}

// ─── Retry ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum completion attempts (first call + retries).
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay; attempt N waits base * 2^(N-1).
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff ceiling, seconds.
    #[serde(default = "default_retry_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_secs: default_retry_max_delay_secs(),
        }
    }
}

fn default_retry_max_attempts() -> u32 {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_retry_max_delay_secs() -> u64 {
    120
}

// ─── Provider limits ──────────────────────────────────────────────────────────

/// Outbound request shaping for one provider.
///
/// `requests_per_minute = 0` means no request-interval floor from the RPM
/// side (an explicit `min_interval_ms` still applies).  `tokens_per_minute = 0`
/// disables token shaping entirely; interval shaping is unaffected.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProviderLimits {
    #[serde(default)]
    pub requests_per_minute: u32,
    #[serde(default)]
    pub min_interval_ms: u64,
    #[serde(default)]
    pub tokens_per_minute: u32,
}

// ─── Tools ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default foreground shell timeout, seconds.
    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,
    /// Upper bound a tool call may request for its timeout, seconds.
    #[serde(default = "default_shell_timeout_max_secs")]
    pub shell_timeout_max_secs: u64,
    /// Maximum results returned by the search tools.
    #[serde(default = "default_search_result_cap")]
    pub search_result_cap: usize,
    /// Maximum lines a single read_file call may return.
    #[serde(default = "default_read_line_cap")]
    pub read_line_cap: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell_timeout_secs: default_shell_timeout_secs(),
            shell_timeout_max_secs: default_shell_timeout_max_secs(),
            search_result_cap: default_search_result_cap(),
            read_line_cap: default_read_line_cap(),
        }
    }
}

fn default_shell_timeout_secs() -> u64 {
    30
}
fn default_shell_timeout_max_secs() -> u64 {
    3_600
}
fn default_search_result_cap() -> usize {
    100
}
fn default_read_line_cap() -> usize {
    2_000
}

// ─── Sandbox ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// TinyGo binary used to compile submitted programs to WASM.
    #[serde(default = "default_tinygo_path")]
    pub tinygo_path: String,
    /// Default execution budget, seconds.
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound a call may request for its budget, seconds.
    #[serde(default = "default_sandbox_timeout_max_secs")]
    pub timeout_max_secs: u64,
    /// Fraction of the model context window sandbox stdout may occupy before
    /// the output compactor summarises it.
    #[serde(default = "default_context_window_percent")]
    pub context_window_percent: f32,
    /// Byte cap on HTTP response bodies returned to sandboxed code.
    #[serde(default = "default_fetch_body_cap")]
    pub fetch_body_cap: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            tinygo_path: default_tinygo_path(),
            timeout_secs: default_sandbox_timeout_secs(),
            timeout_max_secs: default_sandbox_timeout_max_secs(),
            context_window_percent: default_context_window_percent(),
            fetch_body_cap: default_fetch_body_cap(),
        }
    }
}

fn default_tinygo_path() -> String {
    "tinygo".into()
}
fn default_sandbox_timeout_secs() -> u64 {
    30
}
fn default_sandbox_timeout_max_secs() -> u64 {
    3_600
}
fn default_context_window_percent() -> f32 {
    0.5
}
fn default_fetch_body_cap() -> usize {
    1024 * 1024
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses_from_empty_yaml() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.agent.max_iterations, 256);
        assert_eq!(cfg.agent.planning_max_iterations, 96);
        assert_eq!(cfg.retry.max_delay_secs, 120);
        assert_eq!(cfg.sandbox.timeout_secs, 30);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let cfg: Config = serde_yaml::from_str("agent:\n  max_iterations: 12\n").unwrap();
        assert_eq!(cfg.agent.max_iterations, 12);
        assert!((cfg.agent.compaction_threshold - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn provider_limits_default_to_zero() {
        let l = ProviderLimits::default();
        assert_eq!(l.requests_per_minute, 0);
        assert_eq!(l.min_interval_ms, 0);
        assert_eq!(l.tokens_per_minute, 0);
    }

    #[test]
    fn limits_map_parses_per_provider() {
        let yaml = "limits:\n  openai:\n    requests_per_minute: 60\n    tokens_per_minute: 90000\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let l = cfg.limits.get("openai").unwrap();
        assert_eq!(l.requests_per_minute, 60);
        assert_eq!(l.tokens_per_minute, 90_000);
    }

    #[test]
    fn strategy_kind_parses_lowercase() {
        let cfg: Config = serde_yaml::from_str("agent:\n  strategy: aggressive\n").unwrap();
        assert_eq!(cfg.agent.strategy, StrategyKind::Aggressive);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.agent.max_iterations, cfg.agent.max_iterations);
        assert_eq!(back.model.provider, cfg.model.provider);
    }
}
