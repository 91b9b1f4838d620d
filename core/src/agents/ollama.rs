//! Ollama agent client: JSON-in-text tool calling. Ollama's native
//! `tool_calls` field is unreliable across models in practice, so tool
//! schemas are injected into the system message and the model is asked to
//! reply with a JSON object when it wants to call one.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{AppError, AppResult};
use crate::mcp::ToolDefinition;
use super::{AgentClient, ChatMessage, EventStream, StreamEvent, ToolCallRequest};

const TOOL_CALL_INSTRUCTIONS: &str = "You have access to the following tools. If you need to call one, \
respond with ONLY a JSON object of the exact shape {\"tool_name\": <name>, \"tool_parameters\": <args>} \
and nothing else. Otherwise respond normally.";

pub struct OllamaAgentClient {
    http: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ToolCallPayload {
    tool_name: String,
    #[serde(default)]
    tool_parameters: Value,
}

impl OllamaAgentClient {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    fn messages_with_tools(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Vec<ChatMessage> {
        if tools.is_empty() {
            return messages.to_vec();
        }
        let schemas: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description.clone().unwrap_or_default(),
                    "parameters": t.parameters,
                })
            })
            .collect();
        let system = format!(
            "{TOOL_CALL_INSTRUCTIONS}\n\nAvailable tools:\n{}",
            serde_json::to_string_pretty(&schemas).unwrap_or_default()
        );
        let mut out = vec![ChatMessage::system(system)];
        out.extend_from_slice(messages);
        out
    }

    /// Parses a fully buffered assistant turn: if the stripped content
    /// begins with `{` and deserializes to the tool-call shape, that's a
    /// `ToolCall` event; anything else (including a `{` that fails to
    /// parse) is re-emitted as plain content.
    fn parse_turn(content: &str) -> StreamEvent {
        let trimmed = content.trim_start();
        if trimmed.starts_with('{') {
            if let Ok(payload) = serde_json::from_str::<ToolCallPayload>(trimmed) {
                return StreamEvent::ToolCall {
                    call: ToolCallRequest {
                        id: uuid::Uuid::new_v4().to_string(),
                        name: payload.tool_name,
                        arguments: payload.tool_parameters,
                    },
                };
            }
        }
        StreamEvent::Content { delta: content.to_string() }
    }

    async fn chat_body(&self, messages: &[ChatMessage], stream: bool) -> Value {
        let wire: Vec<OllamaMessage> = messages
            .iter()
            .map(|m| OllamaMessage {
                role: role_str(&m.role),
                content: m.content.clone(),
            })
            .collect();
        json!({
            "model": self.model,
            "messages": wire,
            "stream": stream,
        })
    }
}

fn role_str(role: &crate::config::MessageRole) -> &'static str {
    use crate::config::MessageRole::*;
    match role {
        System => "system",
        User => "user",
        Assistant => "assistant",
        Developer => "system",
        Tool => "tool",
        Function => "tool",
    }
}

#[derive(Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    message: OllamaChunkMessage,
    #[serde(default)]
    done: bool,
}

#[async_trait]
impl AgentClient for OllamaAgentClient {
    async fn chat(&self, messages: &[ChatMessage]) -> AppResult<String> {
        let body = self.chat_body(messages, false).await;
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("ollama request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "ollama chat failed with status {}",
                response.status()
            )));
        }
        let parsed: OllamaChunk = response
            .json()
            .await
            .map_err(|e| AppError::Transient(format!("invalid ollama response: {e}")))?;
        Ok(parsed.message.content)
    }

    async fn stream_chat(&self, messages: &[ChatMessage]) -> AppResult<EventStream> {
        self.stream_chat_with_tools(messages, &[]).await
    }

    /// Streams content progressively as NDJSON lines arrive from Ollama.
    /// Plain text is forwarded the moment it's decoded; content is withheld
    /// only once the accumulated turn starts looking like a potential JSON
    /// tool call (leading `{`), and released as either a `ToolCall` or a
    /// single trailing `Content` event once the turn ends.
    async fn stream_chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> AppResult<EventStream> {
        let effective_messages = self.messages_with_tools(messages, tools);
        let body = self.chat_body(&effective_messages, true).await;
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("ollama request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "ollama chat failed with status {}",
                response.status()
            )));
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<AppResult<StreamEvent>>(64);
        tokio::spawn(drive_stream(response.bytes_stream(), tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Decodes NDJSON lines from `byte_stream` as they arrive, pushing each onto
/// `tx` the instant it's decoded. Plain text is forwarded immediately;
/// content is withheld only once the accumulated turn starts looking like a
/// potential JSON tool call (leading `{`), and released as either a
/// `ToolCall` or a single trailing `Content` event once the turn ends (or
/// the byte stream closes without an explicit `done`).
async fn drive_stream(
    mut byte_stream: impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
    tx: tokio::sync::mpsc::Sender<AppResult<StreamEvent>>,
) {
    let mut line_buffer = String::new();
    let mut pending = String::new();
    let mut withholding = false;

    loop {
        let chunk = match byte_stream.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                let _ = tx.send(Err(AppError::Transient(format!("ollama stream error: {e}")))).await;
                return;
            }
            None => break,
        };
        line_buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = line_buffer.find('\n') {
            let line = line_buffer[..pos].trim().to_string();
            line_buffer.drain(..=pos);
            if line.is_empty() {
                continue;
            }
            let Ok(parsed) = serde_json::from_str::<OllamaChunk>(&line) else {
                continue;
            };

            if !parsed.message.content.is_empty() {
                if withholding {
                    pending.push_str(&parsed.message.content);
                } else if parsed.message.content.trim_start().starts_with('{') {
                    withholding = true;
                    pending.push_str(&parsed.message.content);
                } else if tx
                    .send(Ok(StreamEvent::Content { delta: parsed.message.content }))
                    .await
                    .is_err()
                {
                    return;
                }
            }

            if parsed.done {
                if !pending.is_empty() {
                    let _ = tx.send(Ok(OllamaAgentClient::parse_turn(&pending))).await;
                }
                return;
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(Ok(OllamaAgentClient::parse_turn(&pending))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn ndjson_bytes(lines: &[&str]) -> impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> {
        let joined = lines.join("\n") + "\n";
        stream::once(async move { Ok(bytes::Bytes::from(joined)) })
    }

    async fn collect(
        byte_stream: impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
    ) -> Vec<StreamEvent> {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        drive_stream(byte_stream, tx).await;
        ReceiverStream::new(rx)
            .map(|event| event.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn plain_text_streams_progressively_before_any_brace() {
        let events = collect(ndjson_bytes(&[
            r#"{"message": {"content": "hel"}, "done": false}"#,
            r#"{"message": {"content": "lo"}, "done": true}"#,
        ]))
        .await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Content { delta: "hel".to_string() },
                StreamEvent::Content { delta: "lo".to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn leading_brace_is_withheld_until_done_then_resolved_as_tool_call() {
        let events = collect(ndjson_bytes(&[
            r#"{"message": {"content": "{\"tool_name\""}, "done": false}"#,
            r#"{"message": {"content": ": \"ping\", \"tool_parameters\": {}}"}, "done": true}"#,
        ]))
        .await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::ToolCall { call } => assert_eq!(call.name, "ping"),
            other => panic!("expected a single withheld tool call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leading_brace_withheld_until_stream_ends_without_explicit_done() {
        let events = collect(ndjson_bytes(&[
            r#"{"message": {"content": "{ not valid json"}, "done": false}"#,
        ]))
        .await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Content { delta } => assert_eq!(delta, "{ not valid json"),
            other => panic!("expected the withheld content re-emitted, got {other:?}"),
        }
    }

    #[test]
    fn plain_text_turn_is_content() {
        match OllamaAgentClient::parse_turn("just a normal reply") {
            StreamEvent::Content { delta } => assert_eq!(delta, "just a normal reply"),
            _ => panic!("expected content event"),
        }
    }

    #[test]
    fn json_tool_call_turn_is_tool_call() {
        let turn = r#"{"tool_name": "get_weather", "tool_parameters": {"city": "NYC"}}"#;
        match OllamaAgentClient::parse_turn(turn) {
            StreamEvent::ToolCall { call } => {
                assert_eq!(call.name, "get_weather");
                assert_eq!(call.arguments["city"], "NYC");
            }
            _ => panic!("expected tool call event"),
        }
    }

    #[test]
    fn leading_brace_that_fails_to_parse_is_reemitted_as_content() {
        let turn = "{ this is not valid json at all";
        match OllamaAgentClient::parse_turn(turn) {
            StreamEvent::Content { delta } => assert_eq!(delta, turn),
            _ => panic!("expected content fallback"),
        }
    }

    #[test]
    fn leading_whitespace_before_brace_is_still_detected() {
        let turn = "  \n{\"tool_name\": \"ping\", \"tool_parameters\": {}}";
        match OllamaAgentClient::parse_turn(turn) {
            StreamEvent::ToolCall { call } => assert_eq!(call.name, "ping"),
            _ => panic!("expected tool call event"),
        }
    }
}
