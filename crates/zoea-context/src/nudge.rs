// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Escalating synthetic-nudge content and system-prompt broadcast
//! substitution (spec.md §4.5, §4.6).

pub const BROADCAST_PLACEHOLDER: &str = "{{broadcasts}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NudgeLevel {
    Gentle,
    Firm,
    Urgent,
}

impl NudgeLevel {
    pub fn from_count(nudge_count: u32) -> Self {
        match nudge_count {
            0 => NudgeLevel::Gentle,
            1 => NudgeLevel::Firm,
            _ => NudgeLevel::Urgent,
        }
    }
}

/// Content for the ephemeral `{role=user, source=nudge}` message injected
/// when a pilot has no pending user input.
pub fn synthetic_nudge_content(nudge_count: u32) -> String {
    match NudgeLevel::from_count(nudge_count) {
        NudgeLevel::Gentle => {
            "No new instructions. Continue toward your current objective, or pick a reasonable next action.".to_string()
        }
        NudgeLevel::Firm => {
            "You have been idle for a while with no progress. Take a concrete action now — check your status and act on it.".to_string()
        }
        NudgeLevel::Urgent => {
            "You have not made progress in several turns. Stop planning and call a tool right now.".to_string()
        }
    }
}

/// Render a system prompt template, substituting the `{{broadcasts}}`
/// placeholder with the N most recent unique broadcasts. A template with
/// no placeholder is returned unchanged.
pub fn render_system_prompt(template: &str, broadcasts: &[String]) -> String {
    if !template.contains(BROADCAST_PLACEHOLDER) {
        return template.to_string();
    }
    let rendered = if broadcasts.is_empty() {
        "(no recent broadcasts)".to_string()
    } else {
        broadcasts
            .iter()
            .map(|b| format!("- {b}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    template.replace(BROADCAST_PLACEHOLDER, &rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_with_nudge_count() {
        assert_eq!(NudgeLevel::from_count(0), NudgeLevel::Gentle);
        assert_eq!(NudgeLevel::from_count(1), NudgeLevel::Firm);
        assert_eq!(NudgeLevel::from_count(2), NudgeLevel::Urgent);
        assert_eq!(NudgeLevel::from_count(99), NudgeLevel::Urgent);
    }

    #[test]
    fn template_without_placeholder_is_unchanged() {
        assert_eq!(render_system_prompt("you are a pilot", &[]), "you are a pilot");
    }

    #[test]
    fn substitutes_broadcasts_into_placeholder() {
        let out = render_system_prompt(
            "Recent chatter:\n{{broadcasts}}",
            &["found ore".to_string()],
        );
        assert!(out.contains("- found ore"));
        assert!(!out.contains("{{broadcasts}}"));
    }

    #[test]
    fn empty_broadcasts_render_placeholder_text() {
        let out = render_system_prompt("{{broadcasts}}", &[]);
        assert_eq!(out, "(no recent broadcasts)");
    }
}
