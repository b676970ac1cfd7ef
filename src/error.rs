//! Error types shared across the coordinator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("room storage unavailable: {0}")]
    Unavailable(String),
    #[error("room record `{0}` already exists")]
    Conflict(String),
    #[error("room storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("room record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity lookup failed: {0}")]
    Lookup(String),
    #[error("identity table unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity table malformed: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("execution environment `{name}` failed to start: {message}")]
    Start { name: String, message: String },
    #[error("failed to launch program in `{name}`: {message}")]
    Exec { name: String, message: String },
    #[error("unsupported language `{0}`")]
    UnsupportedLanguage(String),
    #[error("no program is running")]
    NotRunning,
    #[error("sandbox io failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("invalid room id")]
    InvalidRoomId,
    #[error("{0}")]
    Denied(crate::access::DenyReason),
    #[error("room unavailable: {0}")]
    Storage(#[from] PersistenceError),
}
