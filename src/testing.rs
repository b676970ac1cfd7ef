//! Fixtures shared by the unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::Config;
use crate::connections::Outbound;
use crate::error::PersistenceError;
use crate::persistence::{
    Identity, MemoryRepository, RoomRecord, RoomRepository, RoomUpdate, TokenTable,
};
use crate::protocol::ServerEvent;
use crate::sandbox::testing::LocalBackend;
use crate::sandbox::SandboxManager;
use crate::state::AppState;

pub fn identity(id: &str) -> Identity {
    Identity {
        id: id.to_string(),
        display_name: id.to_string(),
    }
}

/// State backed by `repository` and a sandbox that runs programs on the
/// host in a scratch directory.
pub fn test_state(repository: Arc<dyn RoomRepository>) -> AppState {
    let workdir_root =
        std::env::temp_dir().join(format!("collabd-test-{}", uuid::Uuid::new_v4()));
    let config = Config {
        flush_interval: Duration::from_millis(50),
        env_idle_ttl: Duration::from_millis(10),
        workdir_root: workdir_root.clone(),
        ..Config::default()
    };
    let sandbox = SandboxManager::new(Arc::new(LocalBackend::default()), workdir_root, "test-");
    let tokens: HashMap<String, Identity> = ["owner", "alice", "mallory"]
        .into_iter()
        .map(|id| (format!("{id}-token"), identity(id)))
        .collect();
    AppState::new(config, repository, Arc::new(TokenTable::new(tokens)), sandbox)
}

/// Everything queued for a connection so far.
pub fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

/// Queued events, without close markers.
pub fn events(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
    drain(rx)
        .into_iter()
        .filter_map(|message| match message {
            Outbound::Event(event) => Some(event),
            Outbound::Close => None,
        })
        .collect()
}

/// In-memory storage whose reads and writes can be switched to fail.
#[derive(Default)]
pub struct FlakyRepository {
    pub inner: MemoryRepository,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyRepository {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> Result<(), PersistenceError> {
        if flag.load(Ordering::SeqCst) {
            Err(PersistenceError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RoomRepository for FlakyRepository {
    async fn find_room(&self, id: &str) -> Result<Option<RoomRecord>, PersistenceError> {
        Self::check(&self.fail_reads)?;
        self.inner.find_room(id).await
    }

    async fn create_room(&self, record: RoomRecord) -> Result<(), PersistenceError> {
        Self::check(&self.fail_writes)?;
        self.inner.create_room(record).await
    }

    async fn upsert_room(&self, id: &str, update: RoomUpdate) -> Result<(), PersistenceError> {
        Self::check(&self.fail_writes)?;
        self.inner.upsert_room(id, update).await
    }

    async fn delete_room(&self, id: &str) -> Result<(), PersistenceError> {
        Self::check(&self.fail_writes)?;
        self.inner.delete_room(id).await
    }

    async fn add_ban(&self, id: &str, identity: &str) -> Result<(), PersistenceError> {
        Self::check(&self.fail_writes)?;
        self.inner.add_ban(id, identity).await
    }
}
