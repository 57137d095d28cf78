//! Provider-agnostic LLM tool-use contract.
//!
//! The queen only ever needs one operation: send a conversation plus a tool
//! catalog, get back content blocks, a stop reason, and token usage. The
//! Anthropic implementation lives in [`anthropic`]; tests use scripted
//! mocks.

pub mod anthropic;
pub mod retry;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Tool described to the model: name, free-text description, JSON-schema
/// input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ToolResult => "tool_result",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool_result" => Some(Role::ToolResult),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn tool_error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ToolMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Token accounting, including cache traffic when the provider reports it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: String,
    pub usage: Usage,
}

impl LlmResponse {
    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    /// The provider stopped because the response hit the token ceiling; any
    /// tool calls in it are unreliable.
    pub fn is_truncated(&self) -> bool {
        self.stop_reason == "max_tokens"
    }
}

/// The one operation the agent loop needs from a provider.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn chat_with_tools(
        &self,
        cancel: &CancellationToken,
        system_prompt: &str,
        messages: &[ToolMessage],
        tools: &[ToolDef],
    ) -> Result<LlmResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_block_serde_tags() {
        let block = ContentBlock::ToolUse {
            id: "call-1".to_string(),
            name: "create_tasks".to_string(),
            input: json!({"tasks": []}),
        };
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["type"], "tool_use");
        assert_eq!(v["name"], "create_tasks");

        let result = ContentBlock::tool_error("call-1", "nope");
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["type"], "tool_result");
        assert_eq!(v["is_error"], true);

        // is_error omitted when false
        let ok = ContentBlock::tool_result("call-1", "fine");
        let v = serde_json::to_value(&ok).unwrap();
        assert!(v.get("is_error").is_none());
    }

    #[test]
    fn message_id_extraction() {
        let msg = ToolMessage {
            role: Role::Assistant,
            content: vec![
                ContentBlock::text("thinking out loud"),
                ContentBlock::ToolUse {
                    id: "a".to_string(),
                    name: "get_status".to_string(),
                    input: json!({}),
                },
                ContentBlock::ToolUse {
                    id: "b".to_string(),
                    name: "get_status".to_string(),
                    input: json!({}),
                },
            ],
        };
        assert_eq!(msg.tool_use_ids(), vec!["a", "b"]);
        assert!(msg.tool_result_ids().is_empty());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.accumulate(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_input_tokens: 2,
            cache_read_input_tokens: 1,
        });
        total.accumulate(&Usage {
            input_tokens: 1,
            ..Default::default()
        });
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 5);
    }
}
