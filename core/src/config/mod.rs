//! Project configuration: the declarative YAML document (schema version
//! `v1`) that describes a LlamaFarm project's models, prompts, RAG
//! databases, datasets, and MCP tool servers.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::{AppError, AppResult};

pub mod schema;

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap())
}

/// Validates a single path component destined for the filesystem: must match
/// the restricted identifier grammar, and must not smuggle `..` or a
/// separator even though those characters are individually allowed by the
/// regex's `.`/`-` classes.
pub fn validate_path_component(value: &str, field: &str) -> AppResult<()> {
    if value.is_empty() || !identifier_re().is_match(value) {
        return Err(AppError::Validation(format!(
            "{field} must match [A-Za-z0-9_.-]+"
        )));
    }
    if value.contains("..") || value.contains('/') || value.contains('\\') {
        return Err(AppError::Validation(format!(
            "{field} must not contain '..' or a path separator"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Openai,
    Ollama,
    Lemonade,
    Universal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Developer,
    Tool,
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    pub messages: Vec<PromptMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub provider: Provider,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub prompts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub default_model: String,
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagDatabase {
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataProcessingStrategy {
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub databases: Vec<RagDatabase>,
    #[serde(default)]
    pub data_processing_strategies: Vec<DataProcessingStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub database: String,
    pub data_processing_strategy: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    Stdio,
    Http,
    Sse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: McpTransport,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

impl McpServerConfig {
    pub fn validate(&self) -> AppResult<()> {
        match self.transport {
            McpTransport::Stdio if self.command.is_none() => Err(AppError::Validation(format!(
                "mcp server '{}': stdio transport requires command",
                self.name
            ))),
            McpTransport::Http | McpTransport::Sse if self.base_url.is_none() => {
                Err(AppError::Validation(format!(
                    "mcp server '{}': {:?} transport requires base_url",
                    self.name, self.transport
                )))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

pub const SCHEMA_VERSION: &str = "v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub schema_version: String,
    pub name: String,
    pub namespace: String,
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub prompts: Vec<Prompt>,
    #[serde(default)]
    pub rag: Option<RagConfig>,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
    #[serde(default)]
    pub mcp: Option<McpConfig>,
}

impl ProjectConfig {
    /// Validates the invariants in the data model: restricted identifiers,
    /// unique model names, a resolvable default model, and datasets that
    /// resolve to declared RAG databases/strategies.
    pub fn validate(&self) -> AppResult<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(AppError::Validation(format!(
                "unsupported schema_version '{}', expected '{}'",
                self.schema_version, SCHEMA_VERSION
            )));
        }
        validate_path_component(&self.name, "name")?;
        validate_path_component(&self.namespace, "namespace")?;

        let mut seen = std::collections::HashSet::new();
        for model in &self.runtime.models {
            if !seen.insert(model.name.as_str()) {
                return Err(AppError::Validation(format!(
                    "duplicate model name '{}'",
                    model.name
                )));
            }
        }
        if !seen.contains(self.runtime.default_model.as_str()) {
            return Err(AppError::Validation(format!(
                "default_model '{}' does not resolve to a declared model",
                self.runtime.default_model
            )));
        }

        let rag = self.rag.clone().unwrap_or_default();
        let db_names: std::collections::HashSet<_> =
            rag.databases.iter().map(|d| d.name.as_str()).collect();
        let strategy_names: std::collections::HashSet<_> = rag
            .data_processing_strategies
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        for dataset in &self.datasets {
            if !db_names.contains(dataset.database.as_str()) {
                return Err(AppError::Validation(format!(
                    "dataset '{}' references unknown database '{}'",
                    dataset.name, dataset.database
                )));
            }
            if !strategy_names.contains(dataset.data_processing_strategy.as_str()) {
                return Err(AppError::Validation(format!(
                    "dataset '{}' references unknown data_processing_strategy '{}'",
                    dataset.name, dataset.data_processing_strategy
                )));
            }
        }

        if let Some(mcp) = &self.mcp {
            for server in &mcp.servers {
                server.validate()?;
            }
        }

        Ok(())
    }

    pub fn find_model(&self, name: &str) -> Option<&ModelDescriptor> {
        self.runtime.models.iter().find(|m| m.name == name)
    }

    /// Resolves the prompt bundle a model should use: its own `prompts`
    /// list if set, otherwise every project-level prompt.
    pub fn prompts_for_model(&self, model_name: &str) -> Vec<&Prompt> {
        let wanted = self
            .find_model(model_name)
            .and_then(|m| m.prompts.as_ref());
        match wanted {
            Some(names) => self
                .prompts
                .iter()
                .filter(|p| names.contains(&p.name))
                .collect(),
            None => self.prompts.iter().collect(),
        }
    }

    /// Loads and validates a project document from `path`.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::NotFound(format!("project file not found: {e}")))?;
        let config: ProjectConfig = serde_yaml::from_str(&text)
            .map_err(|e| AppError::Validation(format!("invalid project YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Atomically writes the document: serialize to `{path}.tmp`, then
    /// rename over `path`.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        self.validate()?;
        let text = serde_yaml::to_string(self).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        let tmp_path = path.with_extension("yaml.tmp");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Internal(e.into()))?;
        }
        std::fs::write(&tmp_path, text).map_err(|e| AppError::Internal(e.into()))?;
        std::fs::rename(&tmp_path, path).map_err(|e| AppError::Internal(e.into()))?;
        Ok(())
    }
}

/// Resolves `{projects_root}/{namespace}/{name}/llamafarm.yaml`, rejecting
/// any component that escapes the restricted identifier grammar.
pub fn project_file_path(projects_root: &Path, namespace: &str, name: &str) -> AppResult<PathBuf> {
    validate_path_component(namespace, "namespace")?;
    validate_path_component(name, "name")?;
    Ok(projects_root.join(namespace).join(name).join("llamafarm.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProjectConfig {
        ProjectConfig {
            schema_version: SCHEMA_VERSION.to_string(),
            name: "demo".to_string(),
            namespace: "acme".to_string(),
            runtime: RuntimeConfig {
                default_model: "chat".to_string(),
                models: vec![ModelDescriptor {
                    name: "chat".to_string(),
                    provider: Provider::Ollama,
                    model: "llama3".to_string(),
                    base_url: None,
                    api_key: None,
                    prompts: None,
                }],
            },
            prompts: vec![],
            rag: None,
            datasets: vec![],
            mcp: None,
        }
    }

    #[test]
    fn validates_clean_config() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn rejects_unresolved_default_model() {
        let mut cfg = sample();
        cfg.runtime.default_model = "missing".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_model_names() {
        let mut cfg = sample();
        let dup = cfg.runtime.models[0].clone();
        cfg.runtime.models.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_schema_version() {
        let mut cfg = sample();
        cfg.schema_version = "v2".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_path_traversal_in_name() {
        assert!(validate_path_component("../etc", "name").is_err());
        assert!(validate_path_component("a/b", "name").is_err());
        assert!(validate_path_component("fine-name_1.0", "name").is_ok());
    }

    #[test]
    fn dataset_must_resolve_database_and_strategy() {
        let mut cfg = sample();
        cfg.rag = Some(RagConfig {
            databases: vec![RagDatabase {
                name: "docs".to_string(),
                extra: Default::default(),
            }],
            data_processing_strategies: vec![DataProcessingStrategy {
                name: "default".to_string(),
                extra: Default::default(),
            }],
        });
        cfg.datasets.push(Dataset {
            name: "ds1".to_string(),
            database: "docs".to_string(),
            data_processing_strategy: "default".to_string(),
            extra: Default::default(),
        });
        assert!(cfg.validate().is_ok());

        cfg.datasets[0].database = "missing".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mcp_stdio_requires_command() {
        let server = McpServerConfig {
            name: "fs".to_string(),
            transport: McpTransport::Stdio,
            command: None,
            args: vec![],
            env: Default::default(),
            base_url: None,
            headers: Default::default(),
        };
        assert!(server.validate().is_err());
    }

    #[test]
    fn mcp_http_requires_base_url() {
        let server = McpServerConfig {
            name: "remote".to_string(),
            transport: McpTransport::Http,
            command: None,
            args: vec![],
            env: Default::default(),
            base_url: None,
            headers: Default::default(),
        };
        assert!(server.validate().is_err());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llamafarm.yaml");
        let cfg = sample();
        cfg.save(&path).unwrap();
        let loaded = ProjectConfig::load(&path).unwrap();
        assert_eq!(loaded.name, cfg.name);
        assert_eq!(loaded.runtime.default_model, cfg.runtime.default_model);
    }

    #[test]
    fn prompts_for_model_filters_by_list() {
        let mut cfg = sample();
        cfg.prompts = vec![
            Prompt {
                name: "a".to_string(),
                messages: vec![],
            },
            Prompt {
                name: "b".to_string(),
                messages: vec![],
            },
        ];
        cfg.runtime.models[0].prompts = Some(vec!["b".to_string()]);
        let selected = cfg.prompts_for_model("chat");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "b");
    }
}
