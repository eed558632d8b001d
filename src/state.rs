use std::sync::Arc;

use crate::engine::CompletionEngine;
use crate::gateway::registry::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub engine: Arc<dyn CompletionEngine>,
}

impl AppState {
    pub fn new(engine: Arc<dyn CompletionEngine>) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            engine,
        }
    }
}
