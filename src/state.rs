//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::connections::Connections;
use crate::persistence::{IdentityResolver, RoomRepository};
use crate::room::RoomStore;
use crate::sandbox::SandboxManager;

/// Handles to every component; cheap to clone into tasks and handlers.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomStore>,
    pub connections: Arc<Connections>,
    pub sandbox: Arc<SandboxManager>,
    pub repository: Arc<dyn RoomRepository>,
    pub identity: Arc<dyn IdentityResolver>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        config: Config,
        repository: Arc<dyn RoomRepository>,
        identity: Arc<dyn IdentityResolver>,
        sandbox: SandboxManager,
    ) -> Self {
        Self {
            rooms: Arc::new(RoomStore::new(repository.clone())),
            connections: Arc::new(Connections::new()),
            sandbox: Arc::new(sandbox),
            repository,
            identity,
            config: Arc::new(config),
        }
    }
}
