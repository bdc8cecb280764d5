use std::sync::Arc;

use orchestrator_core::Engine;

use crate::security::SecurityPolicy;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub security: SecurityPolicy,
}
