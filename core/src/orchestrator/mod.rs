//! Chat Orchestrator: resolves a model, drives the tool-calling loop,
//! optionally injects RAG context, and persists history across any
//! configured `AgentClient` backend.

pub mod history;
pub mod rag;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

use crate::agents::{client_for, AgentClient, ChatMessage, StreamEvent};
use crate::config::ProjectConfig;
use crate::error::{AppError, AppResult};
use crate::mcp::{McpService, ToolDefinition};
use history::SessionHistory;
use rag::RagBackend;

pub const MAX_TOOL_ITERATIONS: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct RagRequest {
    pub target: String,
    pub queries: Vec<String>,
    pub top_k: usize,
    pub strategy: Option<String>,
    pub jaccard_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub content: String,
}

/// One unit of progress from a running chat turn, delivered to the caller
/// as soon as it's produced rather than after the whole turn completes.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatStreamEvent {
    Content(String),
}

pub struct ChatOrchestrator {
    project_dir: PathBuf,
    config: ProjectConfig,
    mcp: Arc<McpService>,
    rag_backend: Option<Arc<dyn RagBackend>>,
}

impl ChatOrchestrator {
    pub fn new(
        project_dir: PathBuf,
        config: ProjectConfig,
        mcp: Arc<McpService>,
        rag_backend: Option<Arc<dyn RagBackend>>,
    ) -> Self {
        Self {
            project_dir,
            config,
            mcp,
            rag_backend,
        }
    }

    fn leading_messages(&self, model_name: &str) -> Vec<ChatMessage> {
        self.config
            .prompts_for_model(model_name)
            .into_iter()
            .flat_map(|prompt| prompt.messages.iter())
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
                tool_call_id: None,
                name: None,
            })
            .collect()
    }

    /// Runs one full turn and streams `Content` deltas to the caller as the
    /// underlying agent client produces them. Building the initial message
    /// array (leading prompts, history, RAG injection) happens synchronously
    /// before the channel is handed back; the tool-calling loop itself runs
    /// on a spawned task so the caller can start forwarding deltas (e.g. as
    /// SSE events) without waiting for the whole turn to finish.
    pub async fn chat_stream(
        &self,
        model_name: &str,
        session_id: &str,
        user_message: &str,
        rag: Option<RagRequest>,
    ) -> AppResult<tokio::sync::mpsc::Receiver<AppResult<ChatStreamEvent>>> {
        let descriptor = self
            .config
            .find_model(model_name)
            .ok_or_else(|| AppError::NotFound(format!("model '{model_name}' not declared in project")))?
            .clone();
        let client = client_for(&descriptor);

        let mut history = history::load(&self.project_dir, session_id)?;
        let mut messages = self.leading_messages(model_name);
        messages.extend(history.messages.clone());

        let mut effective_user_message = user_message.to_string();
        if let Some(request) = &rag {
            let backend = self
                .rag_backend
                .as_ref()
                .ok_or_else(|| AppError::Validation("rag requested but no backend is configured".to_string()))?;
            let results = rag::run_queries(
                backend.as_ref(),
                &self.project_dir,
                &request.queries,
                user_message,
                &request.target,
                request.top_k,
                request.strategy.as_deref(),
                request.jaccard_threshold,
            )
            .await?;
            if !results.is_empty() {
                let context = results
                    .iter()
                    .map(|r| r.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n---\n");
                effective_user_message = format!("Context:\n{context}\n\nQuestion: {user_message}");
            }
        }

        messages.push(ChatMessage::user(effective_user_message));
        history.messages.push(ChatMessage::user(user_message.to_string()));

        let tools = self.mcp.tool_definitions().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to list mcp tools; continuing without tools");
            Vec::new()
        });

        let project_dir = self.project_dir.clone();
        let session_id = session_id.to_string();
        let mcp = self.mcp.clone();

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            if let Err(e) = run_tool_loop(client.as_ref(), &mcp, messages, history, tools, &project_dir, &session_id, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        Ok(rx)
    }

    /// Runs `chat_stream` to completion and returns the assistant's full
    /// visible text, for callers (the non-streaming completions path) that
    /// don't need incremental delivery.
    pub async fn chat(
        &self,
        model_name: &str,
        session_id: &str,
        user_message: &str,
        rag: Option<RagRequest>,
    ) -> AppResult<String> {
        let mut rx = self.chat_stream(model_name, session_id, user_message, rag).await?;
        let mut visible = String::new();
        while let Some(event) = rx.recv().await {
            match event? {
                ChatStreamEvent::Content(delta) => visible.push_str(&delta),
            }
        }
        Ok(visible)
    }

    pub fn reset_history(&self, session_id: &str) -> AppResult<()> {
        history::reset(&self.project_dir, session_id)
    }

    pub fn session_history(&self, session_id: &str) -> AppResult<SessionHistory> {
        history::load(&self.project_dir, session_id)
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }
}

/// Drives the tool-calling loop to completion, pushing each `Content` delta
/// onto `tx` the instant it arrives from the agent client and persisting
/// history once the turn ends (on success or tool-budget exhaustion).
#[allow(clippy::too_many_arguments)]
async fn run_tool_loop(
    client: &dyn AgentClient,
    mcp: &Arc<McpService>,
    mut messages: Vec<ChatMessage>,
    mut history: SessionHistory,
    tools: Vec<ToolDefinition>,
    project_dir: &Path,
    session_id: &str,
    tx: &Sender<AppResult<ChatStreamEvent>>,
) -> AppResult<()> {
    let mut iterations = 0usize;
    let mut exhausted = true;

    'outer: while iterations < MAX_TOOL_ITERATIONS {
        iterations += 1;
        let mut stream = client.stream_chat_with_tools(&messages, &tools).await?;
        let mut turn_accumulator = String::new();
        let mut tool_call = None;

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Content { delta } => {
                    turn_accumulator.push_str(&delta);
                    if tx.send(Ok(ChatStreamEvent::Content(delta))).await.is_err() {
                        return Ok(());
                    }
                }
                StreamEvent::ToolCall { call } => {
                    tool_call = Some(call);
                    break;
                }
            }
        }

        match tool_call {
            None => {
                exhausted = false;
                if !turn_accumulator.is_empty() {
                    messages.push(ChatMessage::assistant(turn_accumulator.clone()));
                    history.messages.push(ChatMessage::assistant(turn_accumulator));
                }
                break 'outer;
            }
            Some(call) => {
                // Kept even when `turn_accumulator` is empty: a tool-call
                // message immediately follows, so the empty-content rule
                // that otherwise drops empty assistant messages doesn't
                // apply here (see history.rs's persisted-state contract).
                let tool_call_message = ChatMessage::assistant_tool_call(turn_accumulator.clone(), call.name.clone());
                messages.push(tool_call_message.clone());
                history.messages.push(tool_call_message);

                let tool_def = tools.iter().find(|t| t.name == call.name);
                let result_text = match tool_def {
                    None => format!(
                        "Tool {} not found — please try again or answer directly",
                        call.name
                    ),
                    Some(tool_def) => match mcp.invoke(tool_def, Some(call.arguments.clone())).await {
                        Ok(result) => extract_text(&result),
                        Err(e) => format!("Error calling tool {}: {e}", call.name),
                    },
                };

                let tool_message = ChatMessage::tool(result_text, call.id.clone());
                messages.push(tool_message.clone());
                history.messages.push(tool_message);

                let guidance = ChatMessage::assistant(
                    "Use the tool result above to form your final answer.".to_string(),
                );
                messages.push(guidance.clone());
                history.messages.push(guidance);
            }
        }
    }

    if exhausted {
        let terminal = "maximum number of tool calls reached".to_string();
        if tx.send(Ok(ChatStreamEvent::Content(terminal.clone()))).await.is_err() {
            return Ok(());
        }
        messages.push(ChatMessage::assistant(terminal.clone()));
        history.messages.push(ChatMessage::assistant(terminal));
    }

    history::save(project_dir, session_id, &history)
}

fn extract_text(result: &rmcp::model::CallToolResult) -> String {
    let mut output = String::new();
    for content in &result.content {
        if let rmcp::model::RawContent::Text(text) = &content.raw {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&text.text);
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::{CallToolResult, Content};

    #[test]
    fn extract_text_joins_text_parts_with_newlines() {
        let result = CallToolResult::success(vec![Content::text("first"), Content::text("second")]);
        assert_eq!(extract_text(&result), "first\nsecond");
    }

    #[test]
    fn max_tool_iterations_matches_budget() {
        assert_eq!(MAX_TOOL_ITERATIONS, 10);
    }
}
