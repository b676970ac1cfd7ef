//! In-memory room state and the registry that owns it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use crate::access::Policy;
use crate::connections::ConnId;
use crate::error::PersistenceError;
use crate::patch::{self, Change};
use crate::persistence::{RoomRecord, RoomRepository, RoomUpdate};

pub const DEFAULT_ROOM_NAME: &str = "Untitled Session";
pub const DEFAULT_LANGUAGE: &str = "javascript";

/// Read/write level granted to non-owner participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    Edit,
    View,
}

/// Settings supplied when a room is created.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub name: String,
    pub language: String,
    pub access_level: AccessLevel,
    pub is_private: bool,
    pub password: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_ROOM_NAME.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            access_level: AccessLevel::Edit,
            is_private: false,
            password: None,
            expires_at: None,
        }
    }
}

/// A connected member of a room's roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(rename = "id")]
    pub conn: ConnId,
    pub username: String,
    #[serde(rename = "identityId")]
    pub identity: Option<String>,
}

#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub owner: Option<String>,
    pub name: String,
    pub language: String,
    pub access_level: AccessLevel,
    pub is_private: bool,
    pub password: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    content: String,
    version: u64,
    banned: HashSet<String>,
    participants: Vec<Participant>,
}

impl Room {
    /// An empty, ownerless room used when nothing is stored under `id`.
    pub fn new(id: &str) -> Self {
        Self::with_config(id, None, RoomConfig::default())
    }

    pub fn with_config(id: &str, owner: Option<String>, config: RoomConfig) -> Self {
        Self {
            id: id.to_string(),
            owner,
            name: config.name,
            language: config.language,
            access_level: config.access_level,
            is_private: config.is_private,
            password: config.password,
            expires_at: config.expires_at,
            created_at: Utc::now(),
            content: String::new(),
            version: 0,
            banned: HashSet::new(),
            participants: Vec::new(),
        }
    }

    pub fn from_record(record: RoomRecord) -> Self {
        Self {
            id: record.room_id,
            owner: record.owner_id,
            name: record.name,
            language: record.language,
            access_level: record.access_level,
            is_private: record.is_private,
            password: record.password,
            expires_at: record.expires_at,
            created_at: record.created_at,
            content: record.content,
            version: record.version,
            banned: record.banned.into_iter().collect(),
            participants: Vec::new(),
        }
    }

    pub fn to_record(&self) -> RoomRecord {
        let mut banned: Vec<String> = self.banned.iter().cloned().collect();
        banned.sort();
        RoomRecord {
            room_id: self.id.clone(),
            owner_id: self.owner.clone(),
            name: self.name.clone(),
            language: self.language.clone(),
            access_level: self.access_level,
            is_private: self.is_private,
            password: self.password.clone(),
            expires_at: self.expires_at,
            content: self.content.clone(),
            version: self.version,
            banned,
            last_active: Utc::now(),
            created_at: self.created_at,
        }
    }

    /// Fields written back on every flush.
    pub fn to_update(&self) -> RoomUpdate {
        RoomUpdate {
            content: self.content.clone(),
            version: self.version,
            language: self.language.clone(),
            access_level: self.access_level,
            is_private: self.is_private,
            password: self.password.clone(),
            expires_at: self.expires_at,
            last_active: Utc::now(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Applies one edit batch and returns the new version.
    ///
    /// This is the only path that writes `content`.
    pub fn apply_edit(&mut self, changes: &[Change]) -> u64 {
        self.content = patch::apply(&self.content, changes);
        self.version += 1;
        self.version
    }

    pub fn set_language(&mut self, language: &str) {
        self.language = language.to_string();
    }

    pub fn is_owner(&self, identity: Option<&str>) -> bool {
        matches!((self.owner.as_deref(), identity), (Some(owner), Some(id)) if owner == id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    /// Seconds until expiry for rooms that are time-boxed and still open.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        match self.expires_at {
            Some(at) if at >= now => Some((at - now).num_seconds().max(0)),
            _ => None,
        }
    }

    /// Access level a participant actually gets.
    pub fn effective_access(&self, identity: Option<&str>, now: DateTime<Utc>) -> AccessLevel {
        if self.is_owner(identity) {
            AccessLevel::Edit
        } else if self.is_expired(now) {
            AccessLevel::View
        } else {
            self.access_level
        }
    }

    pub fn policy(&self) -> Policy<'_> {
        Policy {
            owner: self.owner.as_deref(),
            is_private: self.is_private,
            password: self.password.as_deref(),
            expires_at: self.expires_at,
            access_level: self.access_level,
            banned: &self.banned,
        }
    }

    pub fn mark_banned(&mut self, identity: &str) -> bool {
        self.banned.insert(identity.to_string())
    }

    pub fn is_banned(&self, identity: &str) -> bool {
        self.banned.contains(identity)
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, conn: ConnId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.conn == conn)
    }

    pub fn find_identity(&self, identity: &str) -> Option<ConnId> {
        self.participants
            .iter()
            .find(|p| p.identity.as_deref() == Some(identity))
            .map(|p| p.conn)
    }

    /// Appends `participant`. Callers evict any previous connection of the
    /// same identity first.
    pub fn add_participant(&mut self, participant: Participant) {
        self.participants.push(participant);
    }

    pub fn remove_participant(&mut self, conn: ConnId) -> Option<Participant> {
        let index = self.participants.iter().position(|p| p.conn == conn)?;
        Some(self.participants.remove(index))
    }

    pub fn connections(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.participants.iter().map(|p| p.conn)
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellState {
    Vacant,
    Live,
    Released,
}

#[derive(Debug)]
struct RoomCell {
    state: CellState,
    room: Room,
}

/// Exclusive access to one live room.
///
/// Holding the guard serializes every other operation on the same room.
pub struct RoomGuard {
    cell: Arc<Mutex<RoomCell>>,
    guard: OwnedMutexGuard<RoomCell>,
}

impl Deref for RoomGuard {
    type Target = Room;

    fn deref(&self) -> &Room {
        &self.guard.room
    }
}

impl DerefMut for RoomGuard {
    fn deref_mut(&mut self) -> &mut Room {
        &mut self.guard.room
    }
}

/// Registry of rooms currently held in memory.
pub struct RoomStore {
    rooms: RwLock<HashMap<String, Arc<Mutex<RoomCell>>>>,
    repository: Arc<dyn RoomRepository>,
}

impl RoomStore {
    pub fn new(repository: Arc<dyn RoomRepository>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            repository,
        }
    }

    /// Materializes a freshly created room in memory.
    pub async fn create(
        &self,
        id: &str,
        owner: &str,
        config: RoomConfig,
    ) -> Result<(), PersistenceError> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(id) {
            return Err(PersistenceError::Conflict(id.to_string()));
        }
        let room = Room::with_config(id, Some(owner.to_string()), config);
        rooms.insert(
            id.to_string(),
            Arc::new(Mutex::new(RoomCell {
                state: CellState::Live,
                room,
            })),
        );
        info!(room = %id, owner = %owner, "room created");
        Ok(())
    }

    /// Locks the room, loading it from storage on a cache miss.
    ///
    /// A room missing from storage becomes an empty default room. Storage
    /// failures are returned and leave nothing behind in memory.
    pub async fn get_or_hydrate(&self, id: &str) -> Result<RoomGuard, PersistenceError> {
        loop {
            let cell = {
                let mut rooms = self.rooms.write().await;
                rooms
                    .entry(id.to_string())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(RoomCell {
                            state: CellState::Vacant,
                            room: Room::new(id),
                        }))
                    })
                    .clone()
            };

            let mut guard = cell.clone().lock_owned().await;
            match guard.state {
                CellState::Released => continue,
                CellState::Live => return Ok(RoomGuard { cell, guard }),
                CellState::Vacant => match self.repository.find_room(id).await {
                    Ok(found) => {
                        if let Some(record) = found {
                            debug!(room = %id, version = record.version, "room hydrated");
                            guard.room = Room::from_record(record);
                        } else {
                            debug!(room = %id, "room not stored, using defaults");
                        }
                        guard.state = CellState::Live;
                        return Ok(RoomGuard { cell, guard });
                    }
                    Err(e) => {
                        guard.state = CellState::Released;
                        self.forget(id, &cell).await;
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Locks a room only if it is already in memory.
    pub async fn get(&self, id: &str) -> Option<RoomGuard> {
        let cell = self.rooms.read().await.get(id)?.clone();
        let guard = cell.clone().lock_owned().await;
        (guard.state == CellState::Live).then_some(RoomGuard { cell, guard })
    }

    /// Removes the room from memory. Waiters queued on the same room retry
    /// against a fresh cell.
    pub async fn release(&self, mut room: RoomGuard) {
        room.guard.state = CellState::Released;
        let id = room.guard.room.id.clone();
        self.forget(&id, &room.cell).await;
        debug!(room = %id, "room released from memory");
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.rooms.read().await.contains_key(id)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    async fn forget(&self, id: &str, cell: &Arc<Mutex<RoomCell>>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(id).is_some_and(|current| Arc::ptr_eq(current, cell)) {
            rooms.remove(id);
        }
    }
}
