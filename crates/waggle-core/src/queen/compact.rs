//! Pair-safe conversation compaction.
//!
//! When the conversation grows past the configured threshold, the middle is
//! replaced with a one-line summary: the objective (first message) survives
//! verbatim, the last `keep_last` messages survive, and the cut point never
//! splits a tool_use/tool_result pair.

use crate::llm::{ContentBlock, Role, ToolMessage};

pub const KEEP_LAST: usize = 20;

/// Compact `messages` down to objective + summary + tail. Returns the input
/// unchanged when it is already short enough.
pub fn compact_messages(messages: &[ToolMessage], keep_last: usize) -> Vec<ToolMessage> {
    // objective + summary + tail must actually shrink the list
    if messages.len() <= keep_last + 2 {
        return messages.to_vec();
    }

    let mut cut = messages.len() - keep_last;
    // A tool_result at the cut would orphan it from its assistant on the
    // dropped side; advance until the boundary is safe.
    while cut < messages.len() && messages[cut].role == Role::ToolResult {
        cut += 1;
    }
    if cut >= messages.len() {
        return messages.to_vec();
    }

    debug_assert!(
        messages[cut].role != Role::ToolResult,
        "compaction cut must not start the tail with a tool_result"
    );

    let dropped = &messages[1..cut];
    let tool_calls = dropped
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.tool_use_ids().len())
        .sum::<usize>();

    let summary = ToolMessage {
        role: Role::User,
        content: vec![ContentBlock::text(format!(
            "[compacted {} turns: {} earlier messages with {} tool calls omitted]",
            dropped.len() / 2,
            dropped.len(),
            tool_calls
        ))],
    };

    let mut out = Vec::with_capacity(2 + messages.len() - cut);
    out.push(messages[0].clone());
    out.push(summary);
    out.extend_from_slice(&messages[cut..]);
    out
}
