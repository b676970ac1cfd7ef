//! Real-time wire events.
//!
//! Every frame is a JSON text message `{"event": <name>, "data": <payload>}`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::DenyReason;
use crate::connections::ConnId;
use crate::patch::Change;
use crate::room::{AccessLevel, Participant};

#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    #[serde(rename = "join_room")]
    JoinRoom {
        room_id: String,
        #[serde(default)]
        password: Option<String>,
    },
    EditorOp {
        room_id: String,
        changes: Vec<Change>,
        #[serde(default)]
        base_version: Option<u64>,
    },
    LanguageChange {
        room_id: String,
        language: String,
    },
    CursorMove {
        room_id: String,
        #[serde(default)]
        position: Value,
    },
    SelectionChange {
        room_id: String,
        #[serde(default)]
        selection: Value,
    },
    SelectionClear {
        room_id: String,
    },
    #[serde(rename = "kick_user")]
    KickUser {
        target_id: ConnId,
    },
    #[serde(rename = "destroy_room")]
    DestroyRoom,
    UpdateSettings(SettingsUpdate),
    #[serde(rename = "run:start")]
    RunStart {
        language: String,
        code: String,
    },
    #[serde(rename = "term:input")]
    TermInput {
        text: String,
    },
    #[serde(rename = "run:stop")]
    RunStop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    SyncSnapshot(Snapshot),
    Resync(Snapshot),
    Error {
        reason: String,
    },
    Ack {
        version: u64,
    },
    EditorOp {
        changes: Vec<Change>,
        version: u64,
    },
    LanguageUpdate(String),
    CursorUpdate {
        user_id: ConnId,
        position: Value,
    },
    SelectionUpdate {
        user_id: ConnId,
        selection: Value,
    },
    SelectionClear(ConnId),
    UserJoined {
        user: Participant,
        users: Vec<Participant>,
        owner_id: Option<String>,
    },
    UserLeft {
        user_id: ConnId,
        username: String,
        users: Vec<Participant>,
        owner_id: Option<String>,
    },
    UserDisconnected(ConnId),
    Kicked {
        reason: String,
    },
    SessionReplaced {},
    RoomDestroyed {
        reason: String,
    },
    RoomSettings(SettingsView),
    Denied {
        action: String,
        reason: DenyReason,
        message: String,
    },
    #[serde(rename = "term:data")]
    TermData(String),
    #[serde(rename = "run:exit")]
    RunExit {
        code: Option<i32>,
    },
}

/// Full room state sent on join and on resync.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub room_id: String,
    pub name: String,
    pub content: String,
    pub version: u64,
    pub language: String,
    pub access_level: AccessLevel,
    pub is_owner: bool,
    pub expiry: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<i64>,
    pub is_time_bounded: bool,
    pub users: Vec<Participant>,
    pub owner_id: Option<String>,
    pub you: ConnId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    pub access_level: AccessLevel,
    pub is_private: bool,
    pub expiry: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<i64>,
    pub is_time_bounded: bool,
}

/// Owner-supplied room settings; absent fields stay unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    #[serde(default)]
    pub access_level: Option<AccessLevel>,
    #[serde(default)]
    pub is_private: Option<bool>,
    /// An empty string clears the password.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub expiry: Option<ExpirySetting>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryPreset {
    #[serde(rename = "never")]
    Never,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "24h")]
    OneDay,
    #[serde(rename = "7d")]
    OneWeek,
}

/// Either a relative preset or an absolute RFC 3339 timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpirySetting {
    Preset(ExpiryPreset),
    At(DateTime<Utc>),
}

impl ExpirySetting {
    pub fn resolve(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ExpirySetting::Preset(ExpiryPreset::Never) => None,
            ExpirySetting::Preset(ExpiryPreset::OneHour) => Some(now + Duration::hours(1)),
            ExpirySetting::Preset(ExpiryPreset::OneDay) => Some(now + Duration::hours(24)),
            ExpirySetting::Preset(ExpiryPreset::OneWeek) => Some(now + Duration::days(7)),
            ExpirySetting::At(at) => Some(at),
        }
    }
}
