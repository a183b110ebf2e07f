use std::sync::Arc;

use gpuq_pipeline::Services;

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub api_key: Arc<String>,
}
