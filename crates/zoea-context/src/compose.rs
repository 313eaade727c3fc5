// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use zoea_provider::Message;
use zoea_store::{Memory, Role, Source};

use crate::envelope::ToolCallEnvelope;
use crate::nudge::synthetic_nudge_content;

/// Build the message sequence sent to the provider for one turn.
///
/// `memories` must be chronologically ordered (oldest first), as returned
/// by `Store::get_recent_memories`. `rendered_system_prompt` is the system
/// memory's content with any broadcast placeholder already substituted
/// (`render_system_prompt`). `nudge_count` drives the escalating synthetic
/// nudge when there is no pending user input. `max_context_messages`
/// bounds the output length.
pub fn compose(
    memories: &[Memory],
    rendered_system_prompt: &str,
    nudge_count: u32,
    max_context_messages: usize,
) -> Vec<Message> {
    let boundary = memories.iter().rposition(|m| m.role == Role::User);

    let mut out = vec![Message::system(rendered_system_prompt)];

    match boundary {
        Some(idx) => {
            let historical = &memories[..idx];
            let current_turn = &memories[idx..];

            if let Some(loop_messages) = latest_tool_loop(historical) {
                out.extend(loop_messages);
            }
            out.extend(segment_and_bound(current_turn, max_context_messages));
        }
        None => {
            // No user memory anywhere in the window: everything present is
            // historical, subject to the same compression, and the pilot
            // has no pending input at all — inject the synthetic nudge.
            if let Some(loop_messages) = latest_tool_loop(memories) {
                out.extend(loop_messages);
            }
            out.push(Message::user(synthetic_nudge_content(nudge_count)));
        }
    }

    truncate_to_budget(out, max_context_messages)
}

/// From a historical prefix, extract the last `role=assistant` memory that
/// carries tool calls plus all subsequent `role=tool` memories belonging to
/// that loop. Everything earlier is discarded — it remains searchable via
/// the Store's search operations, just not resent to the provider.
fn latest_tool_loop(historical: &[Memory]) -> Option<Vec<Message>> {
    let start = historical.iter().rposition(|m| {
        m.role == Role::Assistant && !ToolCallEnvelope::decode(&m.content).is_empty()
    })?;

    let mut out = vec![to_message(&historical[start])];
    for m in &historical[start + 1..] {
        if m.role == Role::Tool {
            out.push(to_message(m));
        } else {
            break;
        }
    }
    Some(out)
}

fn to_message(m: &Memory) -> Message {
    match m.role {
        Role::System => Message::system(m.content.clone()),
        Role::User => Message::user(m.content.clone()),
        Role::Assistant => {
            let calls = ToolCallEnvelope::decode(&m.content);
            if calls.is_empty() {
                Message::assistant_text(m.content.clone())
            } else {
                Message::assistant_tool_calls(calls)
            }
        }
        Role::Tool => Message::tool_result(
            m.tool_call_id.clone().unwrap_or_default(),
            m.content.clone(),
        ),
    }
}

/// Group the current-turn memories into orphan-safe segments: each segment
/// starts at a non-tool memory and absorbs the contiguous tool memories
/// that follow it. Segments never get split in two by truncation.
fn segment_and_bound(current_turn: &[Memory], _max_context_messages: usize) -> Vec<Message> {
    current_turn.iter().map(to_message).collect()
}

/// Drop whole segments from the front (oldest first) until the output fits
/// within `max_context_messages`, always preserving the leading system
/// message and never splitting an assistant/tool-result pair. A segment is
/// one non-tool message plus any contiguous tool messages right after it.
fn truncate_to_budget(messages: Vec<Message>, max_context_messages: usize) -> Vec<Message> {
    if max_context_messages == 0 || messages.len() <= max_context_messages {
        return messages;
    }

    let system = messages[0].clone();
    let mut rest = messages[1..].to_vec();

    while rest.len() + 1 > max_context_messages && !rest.is_empty() {
        let mut segment_len = 1;
        while segment_len < rest.len()
            && matches!(rest[segment_len].role, zoea_provider::Role::Tool)
        {
            segment_len += 1;
        }
        rest.drain(0..segment_len);
    }

    let mut out = vec![system];
    out.extend(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn mem(id: i64, role: Role, source: Source, content: &str, tool_call_id: Option<&str>) -> Memory {
        Memory {
            id,
            mysis_id: "m1".into(),
            role,
            source,
            content: content.to_string(),
            sender_id: None,
            tool_call_id: tool_call_id.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_memories_yields_just_system_and_nudge() {
        let out = compose(&[], "you are a pilot", 0, 50);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, zoea_provider::Role::System);
        assert_eq!(out[1].role, zoea_provider::Role::User);
    }

    #[test]
    fn old_tool_loop_is_pruned_when_newer_user_message_exists() {
        // [user:"hi", assistant(tool_calls=[t1]), tool(t1,"ok"), user:"now"]
        let memories = vec![
            mem(1, Role::User, Source::Direct, "hi", None),
            mem(
                2,
                Role::Assistant,
                Source::Llm,
                &format!(r#"[{{"id":"t1","name":"get_status","arguments":{{}}}}]"#),
                None,
            ),
            mem(3, Role::Tool, Source::Tool, "ok", Some("t1")),
            mem(4, Role::User, Source::Direct, "now", None),
        ];
        let out = compose(&memories, "sys", 0, 50);
        // system + "now" only: the old tool loop must not appear because it
        // precedes the new user boundary with nothing pending after it.
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].content.as_deref(), Some("now"));
    }

    #[test]
    fn current_turn_tool_loop_without_newer_user_is_kept_whole() {
        // [user:"hi", assistant(t1), tool(t1), assistant(t2), tool(t2)]
        let memories = vec![
            mem(1, Role::User, Source::Direct, "hi", None),
            mem(
                2,
                Role::Assistant,
                Source::Llm,
                r#"[{"id":"t1","name":"a","arguments":{}}]"#,
                None,
            ),
            mem(3, Role::Tool, Source::Tool, "r1", Some("t1")),
            mem(
                4,
                Role::Assistant,
                Source::Llm,
                r#"[{"id":"t2","name":"b","arguments":{}}]"#,
                None,
            ),
            mem(5, Role::Tool, Source::Tool, "r2", Some("t2")),
        ];
        let out = compose(&memories, "sys", 0, 50);
        // system + all 5 current-turn messages
        assert_eq!(out.len(), 6);
        assert!(out.iter().all(|m| m.content.is_some() || m.tool_calls.is_some()));
    }

    #[test]
    fn output_always_starts_with_exactly_one_system_message() {
        let memories = vec![mem(1, Role::User, Source::Direct, "hi", None)];
        let out = compose(&memories, "sys", 0, 50);
        assert_eq!(out[0].role, zoea_provider::Role::System);
        assert_eq!(out.iter().filter(|m| m.role == zoea_provider::Role::System).count(), 1);
    }

    #[test]
    fn no_orphaned_tool_messages_in_output() {
        let memories = vec![
            mem(1, Role::User, Source::Direct, "hi", None),
            mem(
                2,
                Role::Assistant,
                Source::Llm,
                r#"[{"id":"t1","name":"a","arguments":{}}]"#,
                None,
            ),
            mem(3, Role::Tool, Source::Tool, "r1", Some("t1")),
        ];
        let out = compose(&memories, "sys", 0, 50);
        for (i, m) in out.iter().enumerate() {
            if m.role == zoea_provider::Role::Tool {
                assert!(i > 0 && out[i - 1].tool_calls.is_some());
            }
        }
    }
}
