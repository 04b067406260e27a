use crate::commands::CommandRegistry;
use crate::services::Orchestrator;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub commands: Arc<CommandRegistry>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, commands: CommandRegistry) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            commands: Arc::new(commands),
        })
    }
}
