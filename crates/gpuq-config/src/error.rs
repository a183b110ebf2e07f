use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("conversion error in {path}: {message}")]
    Conversion { path: String, message: String },

    #[error("task definition not found: {0}")]
    UnknownTemplate(String),

    #[error("task action not found for task: {0}")]
    MissingAction(String),

    #[error("task '{task}' names model '{model}' but model_paths has no entry for it")]
    MissingModelPath { task: String, model: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
