// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod authorizer;
mod interact;
mod jobs;
mod session;

pub use authorizer::{
    AuthorizationDecision, Authorizer, ACTION_FILE_MUTATION, ACTION_SANDBOX_EXEC,
};
pub use interact::{HeadlessInteraction, ScriptedInteraction, TerminalInteraction, UserInteraction};
pub use jobs::{BackgroundJob, JobStatus, StopSignal};
pub use session::Session;
