//! OpenAI-compatible agent client: native function-calling, SSE `data:`
//! framing, per-index tool-call delta accumulation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::mcp::ToolDefinition;
use super::{AgentClient, ChatMessage, EventStream, StreamEvent, ToolCallRequest};

pub struct OpenAiAgentClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiAgentClient {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        }
    }

    fn tools_payload(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description.clone().unwrap_or_default(),
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    async fn post_chat(&self, body: Value) -> AppResult<reqwest::Response> {
        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("openai-compatible request failed: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Default)]
struct Accumulator {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Parses one SSE byte stream into `StreamEvent`s, accumulating tool-call
/// deltas by index until the response's `finish_reason` closes them out.
async fn drive_stream(
    mut byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
) -> AppResult<Vec<StreamEvent>> {
    let mut events = Vec::new();
    let mut calls: BTreeMap<usize, Accumulator> = BTreeMap::new();
    let mut buffer = String::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(|e| AppError::Transient(format!("openai-compatible stream error: {e}")))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end_matches('\r').to_string();
            buffer.drain(..=pos);
            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };
            if payload == "[DONE]" {
                continue;
            }
            let parsed: StreamChunk = match serde_json::from_str(payload) {
                Ok(v) => v,
                Err(_) => continue,
            };
            for choice in parsed.choices {
                if let Some(content) = choice.delta.content {
                    if !content.is_empty() {
                        events.push(StreamEvent::Content { delta: content });
                    }
                }
                if let Some(tool_calls) = choice.delta.tool_calls {
                    for delta in tool_calls {
                        let entry = calls.entry(delta.index).or_default();
                        if let Some(id) = delta.id {
                            entry.id = Some(id);
                        }
                        if let Some(function) = delta.function {
                            if let Some(name) = function.name {
                                entry.name.push_str(&name);
                            }
                            if let Some(arguments) = function.arguments {
                                entry.arguments.push_str(&arguments);
                            }
                        }
                    }
                }
                if choice.finish_reason.as_deref() == Some("tool_calls") {
                    for (_, acc) in std::mem::take(&mut calls) {
                        let Ok(arguments) = serde_json::from_str::<Value>(&acc.arguments) else {
                            continue;
                        };
                        events.push(StreamEvent::ToolCall {
                            call: ToolCallRequest {
                                id: acc.id.unwrap_or_default(),
                                name: acc.name,
                                arguments,
                            },
                        });
                    }
                }
            }
        }
    }
    Ok(events)
}

#[async_trait]
impl AgentClient for OpenAiAgentClient {
    async fn chat(&self, messages: &[ChatMessage]) -> AppResult<String> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });
        let response = self.post_chat(body).await?;
        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "openai-compatible chat failed with status {}",
                response.status()
            )));
        }
        #[derive(Deserialize)]
        struct NonStreamChoice {
            message: NonStreamMessage,
        }
        #[derive(Deserialize)]
        struct NonStreamMessage {
            content: Option<String>,
        }
        #[derive(Deserialize)]
        struct NonStreamResponse {
            choices: Vec<NonStreamChoice>,
        }
        let parsed: NonStreamResponse = response
            .json()
            .await
            .map_err(|e| AppError::Transient(format!("invalid openai-compatible response: {e}")))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn stream_chat(&self, messages: &[ChatMessage]) -> AppResult<EventStream> {
        self.stream_chat_with_tools(messages, &[]).await
    }

    async fn stream_chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> AppResult<EventStream> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = json!(Self::tools_payload(tools));
        }
        let response = self.post_chat(body).await?;
        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "openai-compatible chat failed with status {}",
                response.status()
            )));
        }
        let events = drive_stream(response.bytes_stream()).await?;
        Ok(Box::pin(futures_util::stream::iter(events.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn sse_bytes(lines: &[&str]) -> impl Stream<Item = reqwest::Result<bytes::Bytes>> {
        let joined = lines.join("\n") + "\n";
        stream::once(async move { Ok(bytes::Bytes::from(joined)) })
    }

    #[tokio::test]
    async fn content_deltas_pass_through_verbatim() {
        let events = drive_stream(sse_bytes(&[
            r#"data: {"choices":[{"delta":{"content":"hel"},"finish_reason":null}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"},"finish_reason":null}]}"#,
            "data: [DONE]",
        ]))
        .await
        .unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::Content { delta: "hel".to_string() },
                StreamEvent::Content { delta: "lo".to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn tool_call_deltas_accumulate_by_index() {
        let events = drive_stream(sse_bytes(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_","arguments":""}}]},"finish_reason":null}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"weather","arguments":"{\"city\""}}]},"finish_reason":null}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":\"NYC\"}"}}]},"finish_reason":"tool_calls"}]}"#,
        ]))
        .await
        .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::ToolCall {
                call: ToolCallRequest {
                    id: "call_1".to_string(),
                    name: "get_weather".to_string(),
                    arguments: json!({ "city": "NYC" }),
                }
            }]
        );
    }

    #[tokio::test]
    async fn malformed_tool_arguments_suppress_the_event() {
        let events = drive_stream(sse_bytes(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"x","arguments":"{not json"}}]},"finish_reason":"tool_calls"}]}"#,
        ]))
        .await
        .unwrap();
        assert!(events.is_empty());
    }
}
