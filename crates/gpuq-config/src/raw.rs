use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw YAML entry in task_definitions.yml, keyed by task name.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawDefinition {
    #[serde(default)]
    pub description: String,
    /// "oneoff" (default) or "session".
    #[serde(default = "default_mode")]
    pub mode: String,
    /// "low" (default) or "high".
    #[serde(default = "default_class")]
    pub class: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Absent for tasks that don't load a model.
    pub model_id: Option<String>,
}

fn default_mode() -> String {
    "oneoff".to_string()
}

fn default_class() -> String {
    "low".to_string()
}

fn default_timeout() -> u64 {
    300
}

/// Raw YAML entry in task_actions.yml, keyed by task name.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawAction {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub build_args: HashMap<String, String>,
}

/// Raw YAML entry in model_paths.yml, keyed by model id.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawModelPath {
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub size_gb: f64,
}
