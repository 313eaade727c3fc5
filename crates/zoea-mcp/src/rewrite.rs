// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Error-message rewriting (spec.md §4.4). The naive upstream messages
//! teach the LLM to re-login on every missing parameter, inducing
//! claim→login loops; the rewrites redirect it to reuse an existing
//! `session_id`.

const SESSION_REQUIRED_MARKER: &str = "Get one by calling login() or register() first.";
const SESSION_REQUIRED_REPLACEMENT: &str =
    "Check your recent tool results for session_id from login/register and use it as a parameter.";

const SESSION_INVALID_MARKER: &str = "session_invalid: Session not found or expired. Call login() again";
const SESSION_INVALID_SUFFIX: &str =
    " This means your session truly expired (server restart, timeout, or duplicate login).";

pub fn rewrite_tool_error(text: &str) -> String {
    if text.contains(SESSION_REQUIRED_MARKER) {
        return text.replace(SESSION_REQUIRED_MARKER, SESSION_REQUIRED_REPLACEMENT);
    }
    if text.contains(SESSION_INVALID_MARKER) {
        return format!("{text}{SESSION_INVALID_SUFFIX}");
    }
    text.to_string()
}
