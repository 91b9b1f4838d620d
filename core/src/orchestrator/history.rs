//! Session history persistence:
//! `{project_dir}/sessions/{session_id}/history.json`, written atomically
//! via a tempfile-then-rename, mirroring the project config's save path.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agents::ChatMessage;
use crate::config::validate_path_component;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionHistory {
    pub messages: Vec<ChatMessage>,
}

fn history_path(project_dir: &Path, session_id: &str) -> AppResult<PathBuf> {
    validate_path_component(session_id, "session_id")?;
    Ok(project_dir.join("sessions").join(session_id).join("history.json"))
}

/// Loads the persisted history for `session_id`, or an empty history if no
/// file exists yet.
pub fn load(project_dir: &Path, session_id: &str) -> AppResult<SessionHistory> {
    let path = history_path(project_dir, session_id)?;
    match std::fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt session history: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SessionHistory::default()),
        Err(e) => Err(AppError::Internal(e.into())),
    }
}

/// Atomically writes `history`: serialize to `history.json.tmp`, then
/// rename over `history.json`.
pub fn save(project_dir: &Path, session_id: &str, history: &SessionHistory) -> AppResult<()> {
    let path = history_path(project_dir, session_id)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AppError::Internal(e.into()))?;
    }
    let text = serde_json::to_string_pretty(history).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, text).map_err(|e| AppError::Internal(e.into()))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| AppError::Internal(e.into()))?;
    Ok(())
}

/// Deletes the persisted history file, if any.
pub fn reset(project_dir: &Path, session_id: &str) -> AppResult<()> {
    let path = history_path(project_dir, session_id)?;
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AppError::Internal(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_history_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let history = load(dir.path(), "s1").unwrap();
        assert!(history.messages.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = SessionHistory::default();
        history.messages.push(ChatMessage::user("hi"));
        history.messages.push(ChatMessage::assistant("hello"));
        save(dir.path(), "s1", &history).unwrap();

        let loaded = load(dir.path(), "s1").unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[1].content, "hello");
    }

    #[test]
    fn reset_deletes_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = SessionHistory::default();
        history.messages.push(ChatMessage::user("hi"));
        save(dir.path(), "s1", &history).unwrap();

        reset(dir.path(), "s1").unwrap();
        let loaded = load(dir.path(), "s1").unwrap();
        assert!(loaded.messages.is_empty());
    }

    #[test]
    fn session_id_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path(), "../escape").is_err());
    }
}
