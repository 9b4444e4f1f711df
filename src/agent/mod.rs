// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent process protocol.
//!
//! Supervises one external agent process per session and exchanges
//! line-delimited JSON with it over stdin/stdout. Codex turns are bridged
//! onto the same line protocol.

mod codex;
mod process;
pub mod protocol;
mod runtime;

pub use codex::{map_item, CodexProcess, CodexRuntime};
pub use process::{StreamJsonProcess, StreamJsonRuntime};
pub use protocol::{
    encode_permission_response, encode_user_message, parse_line, AgentMessage, ContentBlock,
    ResponseStream,
};
pub use runtime::{AgentLogPaths, AgentProcess, AgentRuntime, AgentSession};
