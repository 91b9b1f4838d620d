//! Agent Clients: one implementation per upstream chat protocol, both
//! producing the same `StreamEvent` stream so the orchestrator never needs
//! to know which wire format is underneath.

pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{MessageRole, ModelDescriptor, Provider};
use crate::error::AppResult;
use crate::mcp::ToolDefinition;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            name: None,
        }
    }

    /// An assistant message representing a tool call: content is whatever
    /// text preceded the call (possibly empty — the empty case is kept only
    /// because a tool call immediately follows, per the persisted-history
    /// convention), `name` carries the invoked tool's name.
    pub fn assistant_tool_call(content: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            name: Some(tool_name.into()),
        }
    }
}

/// One requested tool invocation, fully accumulated from whatever delta
/// shape the underlying protocol streamed it in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The contract both agent clients produce, byte-for-byte equivalent
/// regardless of wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Content { delta: String },
    ToolCall { call: ToolCallRequest },
}

pub type EventStream = BoxStream<'static, AppResult<StreamEvent>>;

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> AppResult<String>;

    async fn stream_chat(&self, messages: &[ChatMessage]) -> AppResult<EventStream>;

    async fn stream_chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> AppResult<EventStream>;
}

/// Instantiates the agent client matching `descriptor.provider`. Ollama
/// speaks JSON-in-text tool calling; every other provider in the registry
/// (openai, lemonade, universal) speaks the OpenAI-compatible protocol.
pub fn client_for(descriptor: &ModelDescriptor) -> Box<dyn AgentClient> {
    let base_url = descriptor
        .base_url
        .clone()
        .unwrap_or_else(|| default_base_url(descriptor.provider));
    match descriptor.provider {
        Provider::Ollama => Box::new(ollama::OllamaAgentClient::new(base_url, descriptor.model.clone())),
        Provider::Openai | Provider::Lemonade | Provider::Universal => Box::new(
            openai::OpenAiAgentClient::new(base_url, descriptor.model.clone(), descriptor.api_key.clone()),
        ),
    }
}

fn default_base_url(provider: Provider) -> String {
    match provider {
        Provider::Ollama => "http://localhost:11434".to_string(),
        Provider::Openai => "https://api.openai.com/v1".to_string(),
        Provider::Lemonade => "http://localhost:8000/api/v1".to_string(),
        Provider::Universal => "http://localhost:8123/v1".to_string(),
    }
}
