//! Dotted-path editing and schema introspection over [`ProjectConfig`],
//! letting an LLM-driven caller propose and atomically apply edits without
//! knowing the Rust type directly.

use serde::Serialize;
use serde_json::Value;

use super::ProjectConfig;
use crate::error::{AppError, AppResult};

/// A single dotted-path segment: a map key or an array index.
#[derive(Debug, Clone)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parses `rag.databases[0].name` into `[Key(rag), Key(databases), Index(0), Key(name)]`.
fn parse_path(path: &str) -> AppResult<Vec<Segment>> {
    let mut segments = Vec::new();
    for raw in path.split('.') {
        if raw.is_empty() {
            return Err(AppError::Validation(format!("invalid field path '{path}'")));
        }
        let mut rest = raw;
        if let Some(bracket) = rest.find('[') {
            let key = &rest[..bracket];
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            rest = &rest[bracket..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let end = stripped
                    .find(']')
                    .ok_or_else(|| AppError::Validation(format!("invalid field path '{path}'")))?;
                let idx: usize = stripped[..end]
                    .parse()
                    .map_err(|_| AppError::Validation(format!("invalid index in '{path}'")))?;
                segments.push(Segment::Index(idx));
                rest = &stripped[end + 1..];
            }
        } else {
            segments.push(Segment::Key(rest.to_string()));
        }
    }
    if segments.is_empty() {
        return Err(AppError::Validation("empty field path".to_string()));
    }
    Ok(segments)
}

fn get_path<'a>(root: &'a Value, path: &str) -> AppResult<&'a Value> {
    let segments = parse_path(path)?;
    let mut current = root;
    for segment in &segments {
        current = match segment {
            Segment::Key(key) => current.get(key).ok_or_else(|| {
                AppError::Validation(format!("field path '{path}' has no segment '{key}'"))
            })?,
            Segment::Index(idx) => current.get(idx).ok_or_else(|| {
                AppError::Validation(format!("field path '{path}' index {idx} out of range"))
            })?,
        };
    }
    Ok(current)
}

fn set_path(root: &mut Value, path: &str, value: Value) -> AppResult<()> {
    let segments = parse_path(path)?;
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        current = match segment {
            Segment::Key(key) => current.get_mut(key).ok_or_else(|| {
                AppError::Validation(format!("field path '{path}' has no segment '{key}'"))
            })?,
            Segment::Index(idx) => current.get_mut(*idx).ok_or_else(|| {
                AppError::Validation(format!("field path '{path}' index {idx} out of range"))
            })?,
        };
    }
    match segments.last().unwrap() {
        Segment::Key(key) => {
            let obj = current
                .as_object_mut()
                .ok_or_else(|| AppError::Validation(format!("'{path}' is not an object")))?;
            obj.insert(key.clone(), value);
        }
        Segment::Index(idx) => {
            let arr = current
                .as_array_mut()
                .ok_or_else(|| AppError::Validation(format!("'{path}' is not an array")))?;
            if *idx >= arr.len() {
                return Err(AppError::Validation(format!(
                    "'{path}' index {idx} out of range"
                )));
            }
            arr[*idx] = value;
        }
    }
    Ok(())
}

/// A single recursive difference between the as-loaded config and the
/// current in-memory one.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldDiff {
    pub path: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

fn diff_values(path: &str, old: &Value, new: &Value, out: &mut Vec<FieldDiff>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(o), Value::Object(n)) => {
            let mut keys: Vec<&String> = o.keys().chain(n.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match (o.get(key), n.get(key)) {
                    (Some(ov), Some(nv)) => diff_values(&child_path, ov, nv, out),
                    (Some(ov), None) => out.push(FieldDiff {
                        path: child_path,
                        old: Some(ov.clone()),
                        new: None,
                    }),
                    (None, Some(nv)) => out.push(FieldDiff {
                        path: child_path,
                        old: None,
                        new: Some(nv.clone()),
                    }),
                    (None, None) => {}
                }
            }
        }
        (Value::Array(o), Value::Array(n)) if o.len() == n.len() => {
            for (i, (ov, nv)) in o.iter().zip(n.iter()).enumerate() {
                diff_values(&format!("{path}[{i}]"), ov, nv, out);
            }
        }
        _ => out.push(FieldDiff {
            path: path.to_string(),
            old: Some(old.clone()),
            new: Some(new.clone()),
        }),
    }
}

/// Per-field description sufficient for an LLM to propose a config edit.
#[derive(Debug, Clone, Serialize)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub r#type: &'static str,
    pub description: &'static str,
    pub required: bool,
    pub default: Option<Value>,
    pub examples: Vec<Value>,
    pub constraints: Vec<&'static str>,
    pub enum_values: Option<Vec<&'static str>>,
    pub guidance: &'static str,
}

/// Fixed, top-level schema description of [`ProjectConfig`].
pub fn describe_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor {
            name: "schema_version",
            r#type: "string",
            description: "Project document schema version",
            required: true,
            default: Some(Value::String("v1".to_string())),
            examples: vec![Value::String("v1".to_string())],
            constraints: vec!["must equal 'v1'"],
            enum_values: Some(vec!["v1"]),
            guidance: "Always 'v1'; do not change.",
        },
        FieldDescriptor {
            name: "name",
            r#type: "string",
            description: "Project name, used as a filesystem path component",
            required: true,
            default: None,
            examples: vec![Value::String("demo".to_string())],
            constraints: vec!["matches [A-Za-z0-9_.-]+", "no '..' or path separators"],
            enum_values: None,
            guidance: "Pick a short, filesystem-safe slug.",
        },
        FieldDescriptor {
            name: "namespace",
            r#type: "string",
            description: "Project namespace, used as a filesystem path component",
            required: true,
            default: None,
            examples: vec![Value::String("acme".to_string())],
            constraints: vec!["matches [A-Za-z0-9_.-]+", "no '..' or path separators"],
            enum_values: None,
            guidance: "Group related projects under one namespace.",
        },
        FieldDescriptor {
            name: "runtime",
            r#type: "object",
            description: "Default model and declared model roster",
            required: true,
            default: None,
            examples: vec![],
            constraints: vec!["default_model must name a declared model", "model names unique"],
            enum_values: None,
            guidance: "Add a model to runtime.models before referencing it elsewhere.",
        },
        FieldDescriptor {
            name: "prompts",
            r#type: "array",
            description: "Named prompt bundles available to models",
            required: false,
            default: Some(Value::Array(vec![])),
            examples: vec![],
            constraints: vec![],
            enum_values: None,
            guidance: "A model with no prompts list uses every project prompt.",
        },
        FieldDescriptor {
            name: "rag",
            r#type: "object",
            description: "RAG databases and processing strategies",
            required: false,
            default: None,
            examples: vec![],
            constraints: vec!["datasets may only reference declared databases/strategies"],
            enum_values: None,
            guidance: "Declare a database and strategy before referencing them from a dataset.",
        },
        FieldDescriptor {
            name: "datasets",
            r#type: "array",
            description: "Named datasets bound to a database and processing strategy",
            required: false,
            default: Some(Value::Array(vec![])),
            examples: vec![],
            constraints: vec!["database and data_processing_strategy must resolve"],
            enum_values: None,
            guidance: "Requires rag.databases/data_processing_strategies to be populated first.",
        },
        FieldDescriptor {
            name: "mcp",
            r#type: "object",
            description: "MCP tool server wiring",
            required: false,
            default: None,
            examples: vec![],
            constraints: vec!["stdio requires command", "http/sse require base_url"],
            enum_values: None,
            guidance: "Each server needs a unique name and a transport-appropriate endpoint.",
        },
    ]
}

/// Loads, validates, diffs, and safely edits a project document.
pub struct ProjectSchemaManipulator {
    loaded: Value,
    current: ProjectConfig,
}

impl ProjectSchemaManipulator {
    pub fn new(config: ProjectConfig) -> AppResult<Self> {
        let loaded = serde_json::to_value(&config).map_err(|e| AppError::Internal(e.into()))?;
        Ok(Self {
            loaded,
            current: config,
        })
    }

    pub fn current(&self) -> &ProjectConfig {
        &self.current
    }

    /// Checks whether setting `path` to `value` yields a valid config,
    /// without mutating any state.
    pub fn validate_change(&self, path: &str, value: Value) -> AppResult<()> {
        let mut scratch =
            serde_json::to_value(&self.current).map_err(|e| AppError::Internal(e.into()))?;
        set_path(&mut scratch, path, value)?;
        let candidate: ProjectConfig =
            serde_json::from_value(scratch).map_err(|e| AppError::Validation(e.to_string()))?;
        candidate.validate()
    }

    /// Applies a single validated change.
    pub fn apply_change(&mut self, path: &str, value: Value) -> AppResult<()> {
        let mut scratch =
            serde_json::to_value(&self.current).map_err(|e| AppError::Internal(e.into()))?;
        set_path(&mut scratch, path, value)?;
        let candidate: ProjectConfig =
            serde_json::from_value(scratch).map_err(|e| AppError::Validation(e.to_string()))?;
        candidate.validate()?;
        self.current = candidate;
        Ok(())
    }

    /// Applies every change in `changes`, atomically: either every change
    /// validates and the resulting config replaces the in-memory state, or
    /// none of it is applied and the previous state is left untouched.
    pub fn apply_changeset(&mut self, changes: &[(String, Value)]) -> AppResult<()> {
        let mut scratch =
            serde_json::to_value(&self.current).map_err(|e| AppError::Internal(e.into()))?;
        for (path, value) in changes {
            set_path(&mut scratch, path, value.clone())?;
        }
        let candidate: ProjectConfig =
            serde_json::from_value(scratch).map_err(|e| AppError::Validation(e.to_string()))?;
        candidate.validate()?;
        self.current = candidate;
        Ok(())
    }

    /// Reads the current value at `path` without mutating anything.
    pub fn get(&self, path: &str) -> AppResult<Value> {
        let value =
            serde_json::to_value(&self.current).map_err(|e| AppError::Internal(e.into()))?;
        get_path(&value, path).cloned()
    }

    /// Recursive diff from the as-loaded document to the current in-memory
    /// config.
    pub fn diff(&self) -> AppResult<Vec<FieldDiff>> {
        let current =
            serde_json::to_value(&self.current).map_err(|e| AppError::Internal(e.into()))?;
        let mut out = Vec::new();
        diff_values("", &self.loaded, &current, &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelDescriptor, Provider, RuntimeConfig, SCHEMA_VERSION};

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
    fn apply_change_updates_field() {
        let mut manip = ProjectSchemaManipulator::new(sample()).unwrap();
        manip
            .apply_change("runtime.models[0].model", Value::String("llama3.1".into()))
            .unwrap();
        assert_eq!(manip.current().runtime.models[0].model, "llama3.1");
    }

    #[test]
    fn apply_change_rejects_invalid_default_model() {
        let mut manip = ProjectSchemaManipulator::new(sample()).unwrap();
        let err = manip.apply_change("runtime.default_model", Value::String("ghost".into()));
        assert!(err.is_err());
        assert_eq!(manip.current().runtime.default_model, "chat");
    }

    #[test]
    fn changeset_is_all_or_nothing() {
        let mut manip = ProjectSchemaManipulator::new(sample()).unwrap();
        let changes = vec![
            ("name".to_string(), Value::String("renamed".into())),
            ("runtime.default_model".to_string(), Value::String("ghost".into())),
        ];
        let result = manip.apply_changeset(&changes);
        assert!(result.is_err());
        // Rolled back: neither the valid nor the invalid change took effect.
        assert_eq!(manip.current().name, "demo");
    }

    #[test]
    fn changeset_commits_when_fully_valid() {
        let mut manip = ProjectSchemaManipulator::new(sample()).unwrap();
        let changes = vec![
            ("name".to_string(), Value::String("renamed".into())),
            (
                "runtime.models[0].model".to_string(),
                Value::String("llama3.1".into()),
            ),
        ];
        manip.apply_changeset(&changes).unwrap();
        assert_eq!(manip.current().name, "renamed");
        assert_eq!(manip.current().runtime.models[0].model, "llama3.1");
    }

    #[test]
    fn diff_reports_changed_leaf() {
        let mut manip = ProjectSchemaManipulator::new(sample()).unwrap();
        manip
            .apply_change("runtime.models[0].model", Value::String("llama3.1".into()))
            .unwrap();
        let diff = manip.diff().unwrap();
        assert!(diff
            .iter()
            .any(|d| d.path == "runtime.models[0].model"));
    }

    #[test]
    fn diff_is_empty_without_changes() {
        let manip = ProjectSchemaManipulator::new(sample()).unwrap();
        assert!(manip.diff().unwrap().is_empty());
    }

    #[test]
    fn describe_fields_covers_top_level() {
        let fields = describe_fields();
        assert!(fields.iter().any(|f| f.name == "runtime"));
        assert!(fields.iter().any(|f| f.name == "mcp"));
    }
}
