use std::sync::Arc;

use gpuq_config::{Settings, TemplateCatalog};
use gpuq_engine::ContainerEngine;
use gpuq_model::ModelCache;
use gpuq_registry::{DeviceRegistry, SessionRegistry, TaskManager};

/// Everything the pipeline touches, as explicit values.
///
/// No hidden globals: the binary builds one bundle at startup and tests build
/// their own with a mock engine and fixture catalog.
#[derive(Clone)]
pub struct Services {
    pub devices: Arc<DeviceRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub tasks: Arc<TaskManager>,
    pub engine: Arc<dyn ContainerEngine>,
    pub models: Arc<ModelCache>,
    pub catalog: Arc<TemplateCatalog>,
    pub settings: Arc<Settings>,
}
