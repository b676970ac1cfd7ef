//! Runtime configuration.

use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::Limits;

/// Interval between persistence flushes.
pub const DEFAULT_FLUSH_SECS: u64 = 5;
/// Idle time after which an unused room's environment is removed (5 minutes).
pub const DEFAULT_ENV_IDLE_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Long-lived containers through the docker CLI.
    Docker,
    /// chroot + namespaces on the host (Linux, root only).
    Namespace,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub flush_interval: Duration,
    pub env_idle_ttl: Duration,
    /// Where room records are stored; in memory when unset.
    pub data_dir: Option<PathBuf>,
    /// JSON token table for identity resolution.
    pub users: Option<PathBuf>,
    pub backend: BackendKind,
    pub image: String,
    pub limits: Limits,
    /// Parent of the per-room working directories.
    pub workdir_root: PathBuf,
    /// Parent of namespace environment roots.
    pub env_root: PathBuf,
    pub env_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_SECS),
            env_idle_ttl: Duration::from_secs(DEFAULT_ENV_IDLE_SECS),
            data_dir: None,
            users: None,
            backend: BackendKind::Docker,
            image: "collabd-runner:latest".to_string(),
            limits: Limits::default(),
            workdir_root: std::env::temp_dir().join("collabd-rooms"),
            env_root: std::env::temp_dir().join("collabd-envs"),
            env_prefix: "collab-".to_string(),
        }
    }
}

impl Config {
    /// Makes the directory settings absolute; bind mounts need absolute
    /// host paths.
    pub fn resolve_paths(mut self) -> std::io::Result<Self> {
        let cwd = std::env::current_dir()?;
        for path in [&mut self.workdir_root, &mut self.env_root] {
            if path.is_relative() {
                *path = cwd.join(&*path);
            }
        }
        Ok(self)
    }
}
