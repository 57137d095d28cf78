//! The LLM-driven agent loop.
//!
//! Each turn: repair the conversation, compact if oversized, call the model
//! (bounded retry), then either handle truncation or dispatch the returned
//! tool calls. The loop ends when the model calls `complete` or `fail`, the
//! turn budget runs out, or the context is cancelled.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::time::Instant;

use anyhow::{anyhow, Result};
use futures::FutureExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::compact::{compact_messages, KEEP_LAST};
use super::tools::{self, LoopSignal, ToolOutcome};
use super::Queen;
use crate::bus::{BusMessage, EventType};
use crate::llm::{retry, ContentBlock, Role, ToolMessage};

const TRUNCATION_NOTICE: &str =
    "[SYSTEM: previous response was truncated at the token limit; any tool calls in it \
     were lost. Retry with a shorter response.]";
const MISSING_RESULT_NOTICE: &str = "not executed; retry possible";

/// How the loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Completed(String),
    Failed(String),
}

pub(super) async fn run_loop(
    queen: &Queen,
    cancel: &CancellationToken,
    conversation: &mut Vec<ToolMessage>,
) -> Result<AgentOutcome> {
    let system_prompt = super::prompt::system_prompt(&queen.cfg, &queen.registry.available_names());
    let tool_defs = tools::catalog();
    let max_turns = queen.cfg.queen.max_iterations;

    let mut turn = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(anyhow!("cancelled"));
        }
        if turn >= max_turns {
            return Ok(AgentOutcome::Failed(format!(
                "max turns exceeded ({max_turns})"
            )));
        }

        repair_history(conversation);
        if conversation.len() > queen.cfg.queen.compact_after_messages {
            let before = conversation.len();
            *conversation = compact_messages(conversation, KEEP_LAST);
            tracing::info!(
                before,
                after = conversation.len(),
                "compacted conversation"
            );
        }

        // shared reborrow so the retry closure's futures can hold it
        let messages: &[ToolMessage] = conversation;
        let response = retry::with_retry(cancel, || {
            queen
                .llm
                .chat_with_tools(cancel, &system_prompt, messages, &tool_defs)
        })
        .await?;

        queen
            .usage
            .lock()
            .expect("usage lock poisoned")
            .accumulate(&response.usage);

        turn += 1;
        queen.iteration.store(turn, Ordering::Relaxed);
        let _ = queen.db.sessions().set_iteration(&queen.session_id(), turn);

        // A max_tokens response is discarded outright: its tool calls are
        // unreliable and its text is mid-sentence. The turn still counts.
        if response.is_truncated() {
            tracing::warn!(turn, "model response truncated, injecting retry notice");
            let notice = ToolMessage::user_text(TRUNCATION_NOTICE);
            conversation.push(notice.clone());
            queen.persist_message(&notice, None)?;
            continue;
        }

        let mut assistant = ToolMessage {
            role: Role::Assistant,
            content: response.content.clone(),
        };
        if assistant.content.is_empty() {
            assistant.content.push(ContentBlock::text("(no response)"));
        }
        conversation.push(assistant.clone());
        queen.persist_message(&assistant, Some(&response.usage))?;

        let calls: Vec<(String, String, serde_json::Value)> = response
            .tool_calls()
            .into_iter()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect();

        if calls.is_empty() {
            // nothing to do and no terminal tool; nudge the model onward
            let nudge = ToolMessage::user_text(
                "No tool calls received. Use the tools to make progress, or call \
                 complete/fail to end the session.",
            );
            conversation.push(nudge.clone());
            queen.persist_message(&nudge, None)?;
            continue;
        }

        let mut result_blocks = Vec::with_capacity(calls.len());
        let mut signal: Option<LoopSignal> = None;

        for (call_id, name, input) in &calls {
            // once a terminal signal is raised, later calls in the same
            // batch are acknowledged but not executed
            let (outcome, call_signal) = if signal.is_some() {
                (
                    ToolOutcome::error("not executed; session is terminating"),
                    None,
                )
            } else {
                dispatch_guarded(queen, cancel, name, input).await
            };
            signal = signal.or(call_signal);

            result_blocks.push(if outcome.is_error {
                ContentBlock::tool_error(call_id.clone(), outcome.output)
            } else {
                ContentBlock::tool_result(call_id.clone(), outcome.output)
            });
        }

        let result_msg = ToolMessage {
            role: Role::ToolResult,
            content: result_blocks,
        };
        conversation.push(result_msg.clone());
        queen.persist_message(&result_msg, None)?;

        match signal {
            Some(LoopSignal::Complete(summary)) => return Ok(AgentOutcome::Completed(summary)),
            Some(LoopSignal::Fail(reason)) => return Ok(AgentOutcome::Failed(reason)),
            Some(LoopSignal::Fatal(reason)) => return Err(anyhow!(reason)),
            None => {}
        }
    }
}

/// Run one tool call with timing, panic containment, and telemetry.
async fn dispatch_guarded(
    queen: &Queen,
    cancel: &CancellationToken,
    name: &str,
    input: &serde_json::Value,
) -> (ToolOutcome, Option<LoopSignal>) {
    let start = Instant::now();
    let result = AssertUnwindSafe(tools::dispatch(queen, cancel, name, input))
        .catch_unwind()
        .await;
    let duration = start.elapsed();

    let (outcome, signal) = match result {
        Ok(pair) => pair,
        Err(_) => {
            tracing::error!(tool = name, "tool handler panicked");
            (
                ToolOutcome::error(format!("tool {name} panicked; no changes applied")),
                None,
            )
        }
    };

    queen.bus.publish(
        BusMessage::new(EventType::ToolExecuted).with_payload(json!({
            "tool": name,
            "duration_ms": duration.as_millis() as u64,
            "is_error": outcome.is_error,
        })),
    );
    tracing::debug!(
        tool = name,
        duration_ms = duration.as_millis() as u64,
        is_error = outcome.is_error,
        "tool executed"
    );

    (outcome, signal)
}

/// Restore conversation invariants in one pass:
/// - every tool_use in an assistant message has exactly one tool_result in
///   the immediately following message (missing ones are synthesised as
///   errors)
/// - tool_results never appear without a matching preceding tool_use
/// - assistant messages are never empty
///
/// Idempotent: repairing a repaired conversation is a no-op.
pub(super) fn repair_history(conversation: &mut Vec<ToolMessage>) {
    let input = std::mem::take(conversation);
    let mut output: Vec<ToolMessage> = Vec::with_capacity(input.len());
    let mut iter = input.into_iter().peekable();

    while let Some(mut msg) = iter.next() {
        match msg.role {
            Role::Assistant => {
                if msg.content.is_empty() {
                    msg.content.push(ContentBlock::text("(empty response)"));
                }
                let expected: Vec<String> =
                    msg.tool_use_ids().iter().map(|s| s.to_string()).collect();
                output.push(msg);

                if expected.is_empty() {
                    continue;
                }

                // collect results from the immediately following message,
                // keeping the first result per id and discarding orphans
                let mut blocks = Vec::with_capacity(expected.len());
                let mut covered: Vec<String> = Vec::new();
                if matches!(iter.peek(), Some(next) if next.role == Role::ToolResult) {
                    let next = iter.next().expect("peeked");
                    for block in next.content {
                        if let ContentBlock::ToolResult { tool_use_id, .. } = &block {
                            if expected.contains(tool_use_id) && !covered.contains(tool_use_id) {
                                covered.push(tool_use_id.clone());
                                blocks.push(block);
                            }
                        }
                    }
                }
                for id in &expected {
                    if !covered.contains(id) {
                        blocks.push(ContentBlock::tool_error(id.clone(), MISSING_RESULT_NOTICE));
                    }
                }
                output.push(ToolMessage {
                    role: Role::ToolResult,
                    content: blocks,
                });
            }
            // a tool_result reaching here has no preceding assistant: orphan
            Role::ToolResult => {}
            Role::User => output.push(msg),
        }
    }

    *conversation = output;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant_with_calls(ids: &[&str]) -> ToolMessage {
        ToolMessage {
            role: Role::Assistant,
            content: ids
                .iter()
                .map(|id| ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: "get_status".to_string(),
                    input: json!({}),
                })
                .collect(),
        }
    }

    fn results_for(ids: &[&str]) -> ToolMessage {
        ToolMessage {
            role: Role::ToolResult,
            content: ids
                .iter()
                .map(|id| ContentBlock::tool_result(id.to_string(), "ok"))
                .collect(),
        }
    }

    fn assert_invariants(conversation: &[ToolMessage]) {
        for (i, msg) in conversation.iter().enumerate() {
            match msg.role {
                Role::Assistant => {
                    assert!(!msg.content.is_empty(), "empty assistant at {i}");
                    let uses = msg.tool_use_ids();
                    if !uses.is_empty() {
                        let next = conversation.get(i + 1).expect("dangling tool_use");
                        assert_eq!(next.role, Role::ToolResult);
                        let mut results = next.tool_result_ids();
                        results.sort_unstable();
                        let mut expected = uses.clone();
                        expected.sort_unstable();
                        assert_eq!(results, expected, "result ids mismatch at {i}");
                    }
                }
                Role::ToolResult => {
                    let prev = conversation.get(i.wrapping_sub(1)).expect("leading result");
                    assert_eq!(prev.role, Role::Assistant);
                }
                Role::User => {}
            }
        }
    }

    #[test]
    fn synthesises_missing_results() {
        let mut conv = vec![
            ToolMessage::user_text("objective"),
            assistant_with_calls(&["a", "b"]),
            results_for(&["a"]),
        ];
        repair_history(&mut conv);
        assert_invariants(&conv);

        let results = &conv[2];
        assert_eq!(results.content.len(), 2);
        match &results.content[1] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "b");
                assert!(content.contains("not executed"));
                assert!(is_error);
            }
            other => panic!("expected synthetic result, got {other:?}"),
        }
    }

    #[test]
    fn synthesises_whole_result_message_when_absent() {
        let mut conv = vec![
            ToolMessage::user_text("objective"),
            assistant_with_calls(&["a"]),
        ];
        repair_history(&mut conv);
        assert_invariants(&conv);
        assert_eq!(conv.len(), 3);
    }

    #[test]
    fn removes_orphan_results() {
        let mut conv = vec![
            ToolMessage::user_text("objective"),
            results_for(&["ghost"]),
            assistant_with_calls(&["a"]),
            ToolMessage {
                role: Role::ToolResult,
                content: vec![
                    ContentBlock::tool_result("a", "ok"),
                    ContentBlock::tool_result("phantom", "??"),
                ],
            },
        ];
        repair_history(&mut conv);
        assert_invariants(&conv);

        // ghost message gone, phantom block dropped
        assert_eq!(conv.len(), 3);
        assert_eq!(conv[2].tool_result_ids(), vec!["a"]);
    }

    #[test]
    fn fills_empty_assistant_messages() {
        let mut conv = vec![
            ToolMessage::user_text("objective"),
            ToolMessage {
                role: Role::Assistant,
                content: vec![],
            },
        ];
        repair_history(&mut conv);
        assert!(!conv[1].content.is_empty());
    }

    #[test]
    fn deduplicates_double_results() {
        let mut conv = vec![
            ToolMessage::user_text("objective"),
            assistant_with_calls(&["a"]),
            ToolMessage {
                role: Role::ToolResult,
                content: vec![
                    ContentBlock::tool_result("a", "first"),
                    ContentBlock::tool_result("a", "second"),
                ],
            },
        ];
        repair_history(&mut conv);
        assert_invariants(&conv);
        assert_eq!(conv[2].content.len(), 1);
        match &conv[2].content[0] {
            ContentBlock::ToolResult { content, .. } => assert_eq!(content, "first"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn repair_is_idempotent() {
        let mut conv = vec![
            ToolMessage::user_text("objective"),
            assistant_with_calls(&["a", "b"]),
            results_for(&["b"]),
            results_for(&["stray"]),
            assistant_with_calls(&[]),
        ];
        repair_history(&mut conv);
        let first_pass: Vec<String> = conv
            .iter()
            .map(|m| serde_json::to_string(m).unwrap())
            .collect();

        repair_history(&mut conv);
        let second_pass: Vec<String> = conv
            .iter()
            .map(|m| serde_json::to_string(m).unwrap())
            .collect();
        assert_eq!(first_pass, second_pass);
        assert_invariants(&conv);
    }
}
