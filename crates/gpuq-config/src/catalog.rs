use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gpuq_domain::{CapabilityClass, ModelId, TaskMode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{RawAction, RawDefinition, RawModelPath};

pub const DEFINITIONS_FILE: &str = "task_definitions.yml";
pub const ACTIONS_FILE: &str = "task_actions.yml";
pub const MODEL_PATHS_FILE: &str = "model_paths.yml";

/// A validated task definition (defaults + identity).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub name: String,
    pub description: String,
    pub mode: TaskMode,
    pub class: CapabilityClass,
    pub timeout_seconds: u64,
    pub metadata: HashMap<String, serde_json::Value>,
    pub model_id: Option<ModelId>,
}

/// How a task's worker container runs.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskAction {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub build_args: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelPathEntry {
    pub model_id: ModelId,
    pub path: PathBuf,
    pub description: String,
    pub size_gb: f64,
}

/// The three parts resolved for one submission.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub definition: TaskDefinition,
    pub action: TaskAction,
    pub model_path: Option<ModelPathEntry>,
}

/// Per-request overrides from the submission body.
///
/// Capability class, timeout, and metadata may be overridden; metadata is a
/// shallow merge where the override wins per key. Mode and image are never
/// overridable.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub class: Option<CapabilityClass>,
    pub timeout_seconds: Option<u64>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Lazily-loading catalog over the three YAML tables in a config directory.
///
/// Lookups read from disk at request time; no global mutable state beyond
/// the filesystem, so a redeployed config file is picked up by the next
/// submission. [`TemplateCatalog::validate`] runs the full cross-table check
/// and is called once at startup; a broken catalog fails the boot.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    dir: PathBuf,
}

impl TemplateCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_table<T: DeserializeOwned>(&self, file: &str) -> Result<HashMap<String, T>, ConfigError> {
        let path = self.dir.join(file);
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn definition(&self, name: &str) -> Result<TaskDefinition, ConfigError> {
        let table: HashMap<String, RawDefinition> = self.load_table(DEFINITIONS_FILE)?;
        let raw = table
            .get(name)
            .ok_or_else(|| ConfigError::UnknownTemplate(name.to_string()))?;
        convert_definition(name, raw, &self.dir.join(DEFINITIONS_FILE))
    }

    pub fn action(&self, name: &str) -> Result<TaskAction, ConfigError> {
        let table: HashMap<String, RawAction> = self.load_table(ACTIONS_FILE)?;
        let raw = table
            .get(name)
            .ok_or_else(|| ConfigError::MissingAction(name.to_string()))?;
        Ok(TaskAction {
            name: name.to_string(),
            image: raw.image.clone(),
            command: raw.command.clone(),
            env: raw.env.clone(),
            build_args: raw.build_args.clone(),
        })
    }

    pub fn model_path(&self, model_id: &ModelId) -> Result<Option<ModelPathEntry>, ConfigError> {
        let table: HashMap<String, RawModelPath> = self.load_table(MODEL_PATHS_FILE)?;
        Ok(table.get(model_id.as_str()).map(|raw| ModelPathEntry {
            model_id: model_id.clone(),
            path: PathBuf::from(&raw.path),
            description: raw.description.clone(),
            size_gb: raw.size_gb,
        }))
    }

    /// Resolve a named template and apply request overrides.
    ///
    /// The model path table is only consulted when the definition names a
    /// model. Resolution is idempotent: the same name and overrides always
    /// yield the same result for an unchanged catalog.
    pub fn resolve(&self, name: &str, overrides: &Overrides) -> Result<ResolvedTask, ConfigError> {
        let mut definition = self.definition(name)?;
        let action = self.action(name)?;

        if let Some(class) = overrides.class {
            definition.class = class;
        }
        if let Some(timeout) = overrides.timeout_seconds {
            definition.timeout_seconds = timeout;
        }
        for (k, v) in &overrides.metadata {
            definition.metadata.insert(k.clone(), v.clone());
        }

        let model_path = match &definition.model_id {
            Some(model_id) => self.model_path(model_id)?,
            None => None,
        };

        debug!(
            task = name,
            mode = %definition.mode,
            class = %definition.class,
            timeout = definition.timeout_seconds,
            "resolved task template"
        );

        Ok(ResolvedTask { definition, action, model_path })
    }

    /// Cross-table validation, run at startup. Every definition must resolve
    /// to an action, and every referenced model id must have a path entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let defs: HashMap<String, RawDefinition> = self.load_table(DEFINITIONS_FILE)?;
        let actions: HashMap<String, RawAction> = self.load_table(ACTIONS_FILE)?;
        let models: HashMap<String, RawModelPath> = self.load_table(MODEL_PATHS_FILE)?;

        for (name, raw) in &defs {
            // Surface mode/class typos at boot, not at first submission.
            convert_definition(name, raw, &self.dir.join(DEFINITIONS_FILE))?;

            if !actions.contains_key(name) {
                return Err(ConfigError::MissingAction(name.clone()));
            }
            if let Some(model_id) = &raw.model_id {
                if !models.contains_key(model_id) {
                    return Err(ConfigError::MissingModelPath {
                        task: name.clone(),
                        model: model_id.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

fn convert_definition(
    name: &str,
    raw: &RawDefinition,
    path: &Path,
) -> Result<TaskDefinition, ConfigError> {
    let mode = parse_mode(&raw.mode, path)?;
    let class = parse_class(&raw.class, path)?;

    Ok(TaskDefinition {
        name: name.to_string(),
        description: raw.description.clone(),
        mode,
        class,
        timeout_seconds: raw.timeout_seconds,
        metadata: raw.metadata.clone(),
        model_id: raw.model_id.as_deref().map(ModelId::new),
    })
}

fn parse_mode(s: &str, path: &Path) -> Result<TaskMode, ConfigError> {
    match s {
        "oneoff" => Ok(TaskMode::Oneoff),
        "session" => Ok(TaskMode::Session),
        other => Err(ConfigError::Conversion {
            path: path.display().to_string(),
            message: format!("unknown task mode '{}'", other),
        }),
    }
}

fn parse_class(s: &str, path: &Path) -> Result<CapabilityClass, ConfigError> {
    match s {
        "low" => Ok(CapabilityClass::Low),
        "high" => Ok(CapabilityClass::High),
        other => Err(ConfigError::Conversion {
            path: path.display().to_string(),
            message: format!("unknown capability class '{}'", other),
        }),
    }
}
