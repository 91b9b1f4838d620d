//! RAG invocation as an external collaborator: the orchestrator only knows
//! about a `search` function; the actual retrieval subsystem lives out of
//! process and is reached by whatever `RagBackend` implementation the
//! caller wires in.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RagResult {
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub score: f64,
}

#[async_trait]
pub trait RagBackend: Send + Sync {
    async fn search(
        &self,
        project_dir: &Path,
        query: &str,
        target: &str,
        top_k: usize,
        strategy: Option<&str>,
    ) -> AppResult<Vec<RagResult>>;
}

/// Shells out to a configured command, passing the query/target/top_k/
/// strategy as arguments and parsing a JSON array of `{content, score,
/// metadata}` from stdout. A nonzero exit is a transient error: the
/// subprocess is assumed to be a retrieval service having a bad moment, not
/// a permanently broken configuration.
pub struct SubprocessRagBackend {
    command: String,
    args: Vec<String>,
}

impl SubprocessRagBackend {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl RagBackend for SubprocessRagBackend {
    async fn search(
        &self,
        project_dir: &Path,
        query: &str,
        target: &str,
        top_k: usize,
        strategy: Option<&str>,
    ) -> AppResult<Vec<RagResult>> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .arg("--project-dir")
            .arg(project_dir)
            .arg("--query")
            .arg(query)
            .arg("--target")
            .arg(target)
            .arg("--top-k")
            .arg(top_k.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(strategy) = strategy {
            command.arg("--strategy").arg(strategy);
        }

        let output = command
            .output()
            .await
            .map_err(|e| AppError::Transient(format!("rag subprocess failed to spawn: {e}")))?;

        if !output.status.success() {
            return Err(AppError::Transient(format!(
                "rag subprocess exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| AppError::Transient(format!("rag subprocess produced invalid JSON: {e}")))
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split_whitespace().map(|w| w.to_lowercase()).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Deduplicates `results` in place order: exact content match first, then
/// word-level Jaccard similarity against `threshold`. The first occurrence
/// of a near-duplicate wins.
pub fn dedupe(results: Vec<RagResult>, jaccard_threshold: f64) -> Vec<RagResult> {
    let mut kept: Vec<RagResult> = Vec::new();
    let mut kept_tokens: Vec<HashSet<String>> = Vec::new();
    let mut seen_exact: HashSet<String> = HashSet::new();

    for result in results {
        if !seen_exact.insert(result.content.clone()) {
            continue;
        }
        let tokens = tokenize(&result.content);
        if kept_tokens.iter().any(|existing| jaccard(existing, &tokens) >= jaccard_threshold) {
            continue;
        }
        kept_tokens.push(tokens);
        kept.push(result);
    }
    kept
}

/// Runs one or many queries against `backend`, merges their results,
/// deduplicates, and truncates to `top_k`. If `queries` is empty, `fallback`
/// (the user's message) is used as the single query.
pub async fn run_queries(
    backend: &dyn RagBackend,
    project_dir: &Path,
    queries: &[String],
    fallback: &str,
    target: &str,
    top_k: usize,
    strategy: Option<&str>,
    jaccard_threshold: f64,
) -> AppResult<Vec<RagResult>> {
    let effective: Vec<&str> = if queries.is_empty() {
        vec![fallback]
    } else {
        queries.iter().map(String::as_str).collect()
    };

    let mut merged = Vec::new();
    for query in effective {
        let mut results = backend.search(project_dir, query, target, top_k, strategy).await?;
        merged.append(&mut results);
    }

    let mut deduped = dedupe(merged, jaccard_threshold);
    deduped.truncate(top_k);
    Ok(deduped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(content: &str, score: f64) -> RagResult {
        RagResult {
            content: content.to_string(),
            metadata: serde_json::json!({}),
            score,
        }
    }

    #[test]
    fn exact_duplicates_are_removed() {
        let results = vec![result("same text", 0.9), result("same text", 0.5)];
        let deduped = dedupe(results, 0.8);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].score, 0.9);
    }

    #[test]
    fn near_duplicates_above_threshold_are_removed() {
        let results = vec![
            result("the quick brown fox jumps", 0.9),
            result("the quick brown fox leaps", 0.8),
        ];
        let deduped = dedupe(results, 0.6);
        assert_eq!(deduped.len(), 1);
    }

    #[test]
    fn distinct_content_below_threshold_is_kept() {
        let results = vec![result("apples and oranges", 0.9), result("a distant galaxy", 0.8)];
        let deduped = dedupe(results, 0.8);
        assert_eq!(deduped.len(), 2);
    }

    struct FakeBackend;

    #[async_trait]
    impl RagBackend for FakeBackend {
        async fn search(
            &self,
            _project_dir: &Path,
            query: &str,
            _target: &str,
            _top_k: usize,
            _strategy: Option<&str>,
        ) -> AppResult<Vec<RagResult>> {
            Ok(vec![result(&format!("result for {query}"), 1.0)])
        }
    }

    #[tokio::test]
    async fn empty_queries_fall_back_to_user_message() {
        let backend = FakeBackend;
        let results = run_queries(&backend, Path::new("."), &[], "fallback query", "db", 5, None, 0.8)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "result for fallback query");
    }

    #[tokio::test]
    async fn multiple_queries_merge_and_truncate() {
        let backend = FakeBackend;
        let queries = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let results = run_queries(&backend, Path::new("."), &queries, "unused", "db", 2, None, 0.8)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }
}
