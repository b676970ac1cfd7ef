//! Environments as long-lived Docker containers driven through the CLI.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{own_process_group, piped, Limits, SandboxBackend};
use crate::error::SandboxError;

pub struct DockerBackend {
    image: String,
    limits: Limits,
}

impl DockerBackend {
    pub fn new(image: impl Into<String>, limits: Limits) -> Self {
        Self {
            image: image.into(),
            limits,
        }
    }

    fn run_args(&self, name: &str, workdir: &Path) -> Vec<String> {
        let memory = format!("{}m", self.limits.memory_mb);
        vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            memory.clone(),
            "--memory-swap".into(),
            memory,
            "--cpus".into(),
            self.limits.cpus.to_string(),
            "--pids-limit".into(),
            self.limits.pids.to_string(),
            "--ulimit".into(),
            format!("nofile={0}:{0}", self.limits.nofile),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "-v".into(),
            format!("{}:/workspace", workdir.display()),
            "-w".into(),
            "/workspace".into(),
            self.image.clone(),
            "sleep".into(),
            "infinity".into(),
        ]
    }
}

fn pid_file(tag: &str) -> String {
    format!("/tmp/.run-{tag}.pid")
}

/// `docker exec` arguments for one run. The shell leads a new session, so
/// its pid is also the process group of everything the program forks.
fn exec_args(name: &str, tag: &str, command: &str) -> Vec<String> {
    let script = format!("echo $$ > {}; {}", pid_file(tag), command);
    vec![
        "exec".into(),
        "-i".into(),
        name.into(),
        "setsid".into(),
        "-w".into(),
        "sh".into(),
        "-c".into(),
        script,
    ]
}

/// Kills the whole process group recorded for `tag` inside the container.
fn interrupt_script(tag: &str) -> String {
    let file = pid_file(tag);
    format!("p=$(cat {file} 2>/dev/null) && kill -KILL -- -\"$p\"; rm -f {file}")
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn is_live(&self, name: &str) -> bool {
        match Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", name])
            .output()
            .await
        {
            Ok(output) => {
                output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            Err(e) => {
                warn!(error = %e, "docker inspect failed");
                false
            }
        }
    }

    async fn start(&self, name: &str, workdir: &Path) -> Result<(), SandboxError> {
        let output = Command::new("docker")
            .args(self.run_args(name, workdir))
            .output()
            .await
            .map_err(|e| SandboxError::Start {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(SandboxError::Start {
                name: name.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(env = %name, container = %String::from_utf8_lossy(&output.stdout).trim(), "container started");
        Ok(())
    }

    async fn remove(&self, name: &str) {
        let _ = Command::new("docker")
            .args(["rm", "-f", name])
            .output()
            .await;
    }

    fn spawn(
        &self,
        name: &str,
        _workdir: &Path,
        tag: &str,
        command: &str,
    ) -> Result<Child, SandboxError> {
        let mut cmd = Command::new("docker");
        cmd.args(exec_args(name, tag, command));
        own_process_group(piped(&mut cmd));
        cmd.spawn().map_err(|e| SandboxError::Exec {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Killing the `docker exec` client does not reach the process inside
    /// the container, so the run's process group is killed there first.
    async fn interrupt(&self, name: &str, tag: &str, pid: Option<u32>) {
        let script = interrupt_script(tag);
        let _ = Command::new("docker")
            .args(["exec", name, "sh", "-c", &script])
            .output()
            .await;
        if let Some(pid) = pid {
            super::kill_process_group(pid);
        }
    }
}
