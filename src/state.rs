//! Shared application state.

use std::sync::Arc;

use crate::backend::SandboxBackend;
use crate::config::Config;
use crate::manager::ContainerManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ContainerManager>,
}

impl AppState {
    pub fn new(backend: Arc<dyn SandboxBackend>, config: &Config) -> Self {
        Self {
            manager: Arc::new(ContainerManager::new(backend, config)),
        }
    }
}
