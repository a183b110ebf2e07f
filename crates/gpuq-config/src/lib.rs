mod raw;
mod catalog;
mod settings;
pub mod error;

pub use catalog::{
    ModelPathEntry, Overrides, ResolvedTask, TaskAction, TaskDefinition, TemplateCatalog,
};
pub use error::ConfigError;
pub use settings::{parse_capability_class, parse_device_classes, Settings};
