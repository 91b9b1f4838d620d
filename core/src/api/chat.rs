//! `POST /v1/chat/completions`: the orchestrator-backed, OpenAI-compatible
//! chat endpoint. Extensions beyond the OpenAI shape (`session_id`,
//! `rag_enabled`, `rag_queries`, `database`, `retrieval_strategy`, `top_k`)
//! drive `ChatOrchestrator::chat`'s optional RAG invocation.

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;

use crate::error::{AppError, AppResult};
use crate::orchestrator::{ChatStreamEvent, RagRequest};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatMessageBody {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionsRequest {
    pub model: String,
    pub messages: Vec<ChatMessageBody>,
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub rag_enabled: bool,
    #[serde(default)]
    pub rag_queries: Vec<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub retrieval_strategy: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_session_id() -> String {
    "default".to_string()
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: ChatCompletionMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
}

fn last_user_message(messages: &[ChatMessageBody]) -> AppResult<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .ok_or_else(|| AppError::Validation("messages must contain at least one user turn".to_string()))
}

fn rag_request(req: &ChatCompletionsRequest) -> AppResult<Option<RagRequest>> {
    if !req.rag_enabled {
        return Ok(None);
    }
    let target = req
        .dataset
        .clone()
        .or_else(|| req.database.clone())
        .ok_or_else(|| {
            AppError::Validation("rag_enabled requires database or dataset".to_string())
        })?;
    Ok(Some(RagRequest {
        target,
        queries: req.rag_queries.clone(),
        top_k: req.top_k,
        strategy: req.retrieval_strategy.clone(),
        jaccard_threshold: 0.9,
    }))
}

pub async fn completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionsRequest>,
) -> AppResult<axum::response::Response> {
    let user_message = last_user_message(&req.messages)?.to_string();
    let rag = rag_request(&req)?;

    if req.stream {
        let rx = state
            .orchestrator
            .chat_stream(&req.model, &req.session_id, &user_message, rag)
            .await?;
        Ok(stream_response(req.model, rx).into_response())
    } else {
        let content = state
            .orchestrator
            .chat(&req.model, &req.session_id, &user_message, rag)
            .await?;
        Ok(Json(ChatCompletionResponse {
            id: uuid::Uuid::new_v4().to_string(),
            object: "chat.completion",
            model: req.model,
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: ChatCompletionMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: "stop",
            }],
        })
        .into_response())
    }
}

pub async fn reset_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    state.orchestrator.reset_history(&session_id)?;
    Ok(Json(serde_json::json!({ "reset": session_id })))
}

/// Wraps the orchestrator's delta channel as an SSE stream: each
/// `ChatStreamEvent::Content` becomes its own `chat.completion.chunk` event,
/// emitted as soon as the orchestrator produces it, followed by `[DONE]`
/// once the channel closes (turn complete) or errors.
fn stream_response(
    model: String,
    rx: tokio::sync::mpsc::Receiver<AppResult<ChatStreamEvent>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let completion_id = uuid::Uuid::new_v4().to_string();
    let deltas = ReceiverStream::new(rx).map(move |event| {
        let delta = match event {
            Ok(ChatStreamEvent::Content(delta)) => delta,
            Err(e) => format!("[error: {e}]"),
        };
        let chunk = serde_json::json!({
            "id": completion_id,
            "object": "chat.completion.chunk",
            "model": model,
            "choices": [{
                "index": 0,
                "delta": {"role": "assistant", "content": delta},
                "finish_reason": null,
            }],
        });
        Ok(Event::default().data(chunk.to_string()))
    });
    let done = tokio_stream::once(Ok(Event::default().data("[DONE]")));
    Sse::new(deltas.chain(done))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_user_message_picks_most_recent_user_turn() {
        let messages = vec![
            ChatMessageBody {
                role: "user".to_string(),
                content: "first".to_string(),
            },
            ChatMessageBody {
                role: "assistant".to_string(),
                content: "reply".to_string(),
            },
            ChatMessageBody {
                role: "user".to_string(),
                content: "second".to_string(),
            },
        ];
        assert_eq!(last_user_message(&messages).unwrap(), "second");
    }

    #[test]
    fn missing_user_turn_is_rejected() {
        let messages = vec![ChatMessageBody {
            role: "system".to_string(),
            content: "setup".to_string(),
        }];
        assert!(last_user_message(&messages).is_err());
    }

    #[test]
    fn rag_disabled_yields_no_request() {
        let req = ChatCompletionsRequest {
            model: "chat".to_string(),
            messages: vec![],
            session_id: "s".to_string(),
            stream: false,
            rag_enabled: false,
            rag_queries: vec![],
            database: None,
            dataset: None,
            retrieval_strategy: None,
            top_k: 5,
        };
        assert!(rag_request(&req).unwrap().is_none());
    }

    #[test]
    fn rag_enabled_without_target_is_rejected() {
        let req = ChatCompletionsRequest {
            model: "chat".to_string(),
            messages: vec![],
            session_id: "s".to_string(),
            stream: false,
            rag_enabled: true,
            rag_queries: vec![],
            database: None,
            dataset: None,
            retrieval_strategy: None,
            top_k: 5,
        };
        assert!(rag_request(&req).is_err());
    }
}
