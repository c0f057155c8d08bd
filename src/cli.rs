// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Headless AI coding agent runtime.
#[derive(Parser, Debug)]
#[command(name = "runa", version, about)]
pub struct Cli {
    /// Path to the config file (default: ~/.config/runa/config.yaml).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (respects RUST_LOG).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent loop on an objective until it completes or a budget is
    /// exhausted.
    Run {
        /// What the agent should accomplish.
        objective: String,

        /// Session root directory (default: current directory). All tool
        /// paths resolve inside it.
        #[arg(long)]
        root: Option<PathBuf>,

        /// Write the session transcript (messages as JSON) here on exit.
        #[arg(long)]
        transcript: Option<PathBuf>,
    },

    /// Run the planning loop and print the resulting plan.
    Plan {
        /// What to plan.
        objective: String,

        /// Session root directory (default: current directory).
        #[arg(long)]
        root: Option<PathBuf>,

        /// Files dumped into the planning prompt (registered as read).
        #[arg(long = "context-file")]
        context_files: Vec<PathBuf>,

        /// How many questions the planner may ask.
        #[arg(long, default_value_t = 5)]
        max_questions: usize,

        /// Print the plan as JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration and exit.
    ShowConfig,
}
