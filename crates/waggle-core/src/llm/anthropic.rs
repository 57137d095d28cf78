//! Anthropic Messages API client with tool use.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{ContentBlock, LlmResponse, Role, ToolClient, ToolDef, ToolMessage, Usage};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;

pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model: if model.is_empty() {
                DEFAULT_MODEL.to_string()
            } else {
                model
            },
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key =
            std::env::var("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY is not set")?;
        Ok(Self::new(api_key, model))
    }
}

#[async_trait]
impl ToolClient for AnthropicClient {
    async fn chat_with_tools(
        &self,
        cancel: &CancellationToken,
        system_prompt: &str,
        messages: &[ToolMessage],
        tools: &[ToolDef],
    ) -> Result<LlmResponse> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": to_wire_messages(messages),
        });
        if !system_prompt.is_empty() {
            body["system"] = json!(system_prompt);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                }))
                .collect::<Vec<_>>());
        }

        let request = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

        let response = tokio::select! {
            resp = request.send() => resp.context("anthropic request failed")?,
            _ = cancel.cancelled() => return Err(anyhow!("cancelled")),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .map(ToString::to_string)
                })
                .unwrap_or(text);
            // "status NNN" keeps the error classifiable for retry
            return Err(anyhow!("anthropic status {}: {}", status.as_u16(), detail));
        }

        let value: Value = tokio::select! {
            v = response.json::<Value>() => v.context("parse anthropic response")?,
            _ = cancel.cancelled() => return Err(anyhow!("cancelled")),
        };
        parse_response(&value)
    }
}

/// Convert the conversation to Anthropic wire format. The API only knows
/// user/assistant roles; tool_result turns travel as user messages.
fn to_wire_messages(messages: &[ToolMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::Assistant => "assistant",
                Role::User | Role::ToolResult => "user",
            };
            let content: Vec<Value> = msg
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
                    ContentBlock::ToolUse { id, name, input } => json!({
                        "type": "tool_use", "id": id, "name": name, "input": input,
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }),
                })
                .collect();
            json!({ "role": role, "content": content })
        })
        .collect()
}

fn parse_response(value: &Value) -> Result<LlmResponse> {
    let mut content = Vec::new();
    let blocks = value
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for block in &blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                content.push(ContentBlock::text(text));
            }
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("tool_use block missing id"))?;
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("tool_use block missing name"))?;
                content.push(ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: block.get("input").cloned().unwrap_or(json!({})),
                });
            }
            _ => {}
        }
    }

    let usage = value
        .get("usage")
        .map(|u| Usage {
            input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
            cache_creation_input_tokens: u
                .get("cache_creation_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cache_read_input_tokens: u
                .get("cache_read_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(LlmResponse {
        content,
        stop_reason: value
            .get("stop_reason")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_map_tool_result_to_user_role() {
        let messages = vec![
            ToolMessage::user_text("objective"),
            ToolMessage {
                role: Role::Assistant,
                content: vec![ContentBlock::ToolUse {
                    id: "c1".to_string(),
                    name: "get_status".to_string(),
                    input: json!({}),
                }],
            },
            ToolMessage {
                role: Role::ToolResult,
                content: vec![ContentBlock::tool_result("c1", "ok")],
            },
        ];

        let wire = to_wire_messages(&messages);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[1]["role"], "assistant");
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "c1");
    }

    #[test]
    fn parses_tool_use_response() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "Creating the task now."},
                {"type": "tool_use", "id": "toolu_1", "name": "create_tasks",
                 "input": {"tasks": [{"id": "t1"}]}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 120, "output_tokens": 40,
                      "cache_read_input_tokens": 100}
        });

        let resp = parse_response(&raw).unwrap();
        assert_eq!(resp.stop_reason, "tool_use");
        assert_eq!(resp.usage.input_tokens, 120);
        assert_eq!(resp.usage.cache_read_input_tokens, 100);
        let calls = resp.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "create_tasks");
        assert!(!resp.is_truncated());
    }

    #[test]
    fn max_tokens_stop_reason_flags_truncation() {
        let raw = json!({
            "content": [{"type": "text", "text": "partial"}],
            "stop_reason": "max_tokens"
        });
        let resp = parse_response(&raw).unwrap();
        assert!(resp.is_truncated());
    }

    #[test]
    fn malformed_tool_use_rejected() {
        let raw = json!({
            "content": [{"type": "tool_use", "name": "x"}],
            "stop_reason": "tool_use"
        });
        assert!(parse_response(&raw).is_err());
    }
}
