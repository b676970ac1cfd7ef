//! Durable room records and identity lookup.
//!
//! The coordinator talks to storage and authentication only through
//! [`RoomRepository`] and [`IdentityResolver`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{IdentityError, PersistenceError};
use crate::room::{AccessLevel, DEFAULT_LANGUAGE, DEFAULT_ROOM_NAME};

/// A stored room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub room_id: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub banned: Vec<String>,
    #[serde(default = "Utc::now")]
    pub last_active: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_name() -> String {
    DEFAULT_ROOM_NAME.to_string()
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl RoomRecord {
    fn ownerless(room_id: &str) -> Self {
        let now = Utc::now();
        Self {
            room_id: room_id.to_string(),
            owner_id: None,
            name: default_name(),
            language: default_language(),
            access_level: AccessLevel::Edit,
            is_private: false,
            password: None,
            expires_at: None,
            content: String::new(),
            version: 0,
            banned: Vec::new(),
            last_active: now,
            created_at: now,
        }
    }

    fn apply(&mut self, update: RoomUpdate) {
        self.content = update.content;
        self.version = update.version;
        self.language = update.language;
        self.access_level = update.access_level;
        self.is_private = update.is_private;
        self.password = update.password;
        self.expires_at = update.expires_at;
        self.last_active = update.last_active;
    }
}

/// Fields written by a flush.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomUpdate {
    pub content: String,
    pub version: u64,
    pub language: String,
    pub access_level: AccessLevel,
    pub is_private: bool,
    pub password: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_active: DateTime<Utc>,
}

#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn find_room(&self, id: &str) -> Result<Option<RoomRecord>, PersistenceError>;

    /// Inserts a new record; fails if `record.room_id` is taken.
    async fn create_room(&self, record: RoomRecord) -> Result<(), PersistenceError>;

    /// Updates the record, creating an ownerless one when it is missing.
    async fn upsert_room(&self, id: &str, update: RoomUpdate) -> Result<(), PersistenceError>;

    async fn delete_room(&self, id: &str) -> Result<(), PersistenceError>;

    async fn add_ban(&self, id: &str, identity: &str) -> Result<(), PersistenceError>;
}

/// Volatile repository, used when no data directory is configured.
#[derive(Default)]
pub struct MemoryRepository {
    rooms: RwLock<HashMap<String, RoomRecord>>,
}

#[async_trait]
impl RoomRepository for MemoryRepository {
    async fn find_room(&self, id: &str) -> Result<Option<RoomRecord>, PersistenceError> {
        Ok(self.rooms.read().await.get(id).cloned())
    }

    async fn create_room(&self, record: RoomRecord) -> Result<(), PersistenceError> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&record.room_id) {
            return Err(PersistenceError::Conflict(record.room_id));
        }
        rooms.insert(record.room_id.clone(), record);
        Ok(())
    }

    async fn upsert_room(&self, id: &str, update: RoomUpdate) -> Result<(), PersistenceError> {
        self.rooms
            .write()
            .await
            .entry(id.to_string())
            .or_insert_with(|| RoomRecord::ownerless(id))
            .apply(update);
        Ok(())
    }

    async fn delete_room(&self, id: &str) -> Result<(), PersistenceError> {
        self.rooms.write().await.remove(id);
        Ok(())
    }

    async fn add_ban(&self, id: &str, identity: &str) -> Result<(), PersistenceError> {
        let mut rooms = self.rooms.write().await;
        let record = rooms
            .entry(id.to_string())
            .or_insert_with(|| RoomRecord::ownerless(id));
        if !record.banned.iter().any(|b| b == identity) {
            record.banned.push(identity.to_string());
        }
        Ok(())
    }
}

/// One JSON file per room under a data directory.
pub struct JsonDirRepository {
    dir: PathBuf,
    // Serializes read-modify-write cycles on the directory.
    lock: tokio::sync::Mutex<()>,
}

impl JsonDirRepository {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read(&self, id: &str) -> Result<Option<RoomRecord>, PersistenceError> {
        match tokio::fs::read(self.path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, record: &RoomRecord) -> Result<(), PersistenceError> {
        let path = self.path(&record.room_id);
        let tmp = path.with_extension("json.tmp");
        match tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::Unavailable(format!(
                    "data directory {} is missing",
                    self.dir.display()
                )));
            }
            Err(e) => return Err(e.into()),
        }
        tokio::fs::rename(&tmp, &path).await?;
        debug!(room = %record.room_id, path = %path.display(), "room record written");
        Ok(())
    }
}

#[async_trait]
impl RoomRepository for JsonDirRepository {
    async fn find_room(&self, id: &str) -> Result<Option<RoomRecord>, PersistenceError> {
        let _guard = self.lock.lock().await;
        self.read(id).await
    }

    async fn create_room(&self, record: RoomRecord) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().await;
        if self.read(&record.room_id).await?.is_some() {
            return Err(PersistenceError::Conflict(record.room_id));
        }
        self.write(&record).await
    }

    async fn upsert_room(&self, id: &str, update: RoomUpdate) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().await;
        let mut record = self
            .read(id)
            .await?
            .unwrap_or_else(|| RoomRecord::ownerless(id));
        record.apply(update);
        self.write(&record).await
    }

    async fn delete_room(&self, id: &str) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_ban(&self, id: &str, identity: &str) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().await;
        let mut record = self
            .read(id)
            .await?
            .unwrap_or_else(|| RoomRecord::ownerless(id));
        if !record.banned.iter().any(|b| b == identity) {
            record.banned.push(identity.to_string());
        }
        self.write(&record).await
    }
}

/// A resolved, authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    #[serde(alias = "name")]
    pub display_name: String,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Option<Identity>, IdentityError>;
}

/// Static token table, typically loaded from a JSON object of
/// `token -> { id, name }`.
#[derive(Debug, Default, Clone)]
pub struct TokenTable {
    tokens: HashMap<String, Identity>,
}

impl TokenTable {
    pub fn new(tokens: HashMap<String, Identity>) -> Self {
        Self { tokens }
    }

    pub async fn load(path: &Path) -> Result<Self, IdentityError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::new(serde_json::from_slice(&bytes)?))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityResolver for TokenTable {
    async fn resolve(&self, token: &str) -> Result<Option<Identity>, IdentityError> {
        Ok(self.tokens.get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(content: &str, version: u64) -> RoomUpdate {
        RoomUpdate {
            content: content.to_string(),
            version,
            language: "python".to_string(),
            access_level: AccessLevel::Edit,
            is_private: false,
            password: None,
            expires_at: None,
            last_active: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_upsert_creates_then_updates() {
        let repo = MemoryRepository::default();
        repo.upsert_room("R1", update("a", 1)).await.unwrap();
        repo.upsert_room("R1", update("ab", 2)).await.unwrap();
        let record = repo.find_room("R1").await.unwrap().unwrap();
        assert_eq!(record.content, "ab");
        assert_eq!(record.version, 2);
        assert_eq!(record.owner_id, None);
    }

    #[tokio::test]
    async fn memory_create_rejects_duplicates() {
        let repo = MemoryRepository::default();
        repo.create_room(RoomRecord::ownerless("R1")).await.unwrap();
        assert!(matches!(
            repo.create_room(RoomRecord::ownerless("R1")).await,
            Err(PersistenceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn json_dir_keeps_owner_and_bans_across_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonDirRepository::open(dir.path()).await.unwrap();
        let mut record = RoomRecord::ownerless("R1");
        record.owner_id = Some("owner".into());
        repo.create_room(record).await.unwrap();

        repo.add_ban("R1", "mallory").await.unwrap();
        repo.add_ban("R1", "mallory").await.unwrap();
        repo.upsert_room("R1", update("print(1)", 4)).await.unwrap();

        let reopened = JsonDirRepository::open(dir.path()).await.unwrap();
        let record = reopened.find_room("R1").await.unwrap().unwrap();
        assert_eq!(record.owner_id.as_deref(), Some("owner"));
        assert_eq!(record.banned, vec!["mallory".to_string()]);
        assert_eq!(record.content, "print(1)");
        assert_eq!(record.language, "python");

        repo.delete_room("R1").await.unwrap();
        repo.delete_room("R1").await.unwrap();
        assert!(repo.find_room("R1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_dir_reports_missing_directory_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("rooms");
        let repo = JsonDirRepository::open(&data).await.unwrap();
        std::fs::remove_dir_all(&data).unwrap();
        assert!(matches!(
            repo.upsert_room("R1", update("x", 1)).await,
            Err(PersistenceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn json_dir_reports_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("BAD.json"), b"{not json").unwrap();
        let repo = JsonDirRepository::open(dir.path()).await.unwrap();
        assert!(matches!(
            repo.find_room("BAD").await,
            Err(PersistenceError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn token_table_loads_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, br#"{"tok-1": {"id": "u1", "name": "Ada"}}"#).unwrap();
        let table = TokenTable::load(&path).await.unwrap();
        assert_eq!(table.len(), 1);
        let identity = table.resolve("tok-1").await.unwrap().unwrap();
        assert_eq!(identity.display_name, "Ada");
        assert!(table.resolve("nope").await.unwrap().is_none());
    }
}
