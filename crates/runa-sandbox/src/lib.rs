// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod builder;
mod deadline;
mod executor;
mod hostcalls;

pub use builder::{assemble_source, go_mod, Library, SandboxGlobals};
pub use deadline::PausableDeadline;
pub use executor::SandboxTool;
pub use hostcalls::{HostState, SandboxHost};
