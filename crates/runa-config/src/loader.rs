// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::schema::Config;

/// Load the configuration.
///
/// Resolution order:
/// 1. `explicit` path, when given (missing file is an error);
/// 2. `$RUNA_CONFIG` environment variable;
/// 3. `~/.config/runa/config.yaml` (missing file falls back to defaults).
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = explicit {
        return read_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }

    if let Ok(env_path) = std::env::var("RUNA_CONFIG") {
        let expanded = shellexpand::tilde(&env_path).into_owned();
        let path = PathBuf::from(expanded);
        return read_file(&path)
            .with_context(|| format!("failed to load config from RUNA_CONFIG={}", path.display()));
    }

    let default_path = dirs::config_dir()
        .map(|d| d.join("runa").join("config.yaml"))
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    if default_path.exists() {
        read_file(&default_path)
            .with_context(|| format!("failed to load config from {}", default_path.display()))
    } else {
        debug!(path = %default_path.display(), "no config file found; using defaults");
        Ok(Config::default())
    }
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&text)?;
    debug!(path = %path.display(), "loaded config");
    Ok(config)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
