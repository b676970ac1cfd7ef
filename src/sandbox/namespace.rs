//! Environments built from Linux mount/network namespaces and chroot.
//!
//! An environment is a tmpfs root with the host's system directories bound
//! read-only and the room's working directory bound read-write at
//! `/workspace`. Programs are exec'd chrooted into it with no network and
//! rlimits applied. Requires root.

use async_trait::async_trait;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{chdir, chroot, setgid, setuid, Gid, Uid};
use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{own_process_group, piped, Limits, SandboxBackend};
use crate::error::SandboxError;

const NOBODY_UID: u32 = 65534;
const NOBODY_GID: u32 = 65534;

const SYSTEM_DIRS: [&str; 5] = ["/bin", "/lib", "/lib64", "/usr", "/etc"];
const DEVICES: [&str; 4] = ["null", "zero", "urandom", "random"];

/// What gets mounted at one point of an environment root.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MountKind {
    /// The root itself, sized in MB.
    Tmpfs(u64),
    /// A host directory, visible but not writable.
    SystemDir(PathBuf),
    /// A host device node.
    Device(PathBuf),
    Proc,
    /// The room's working directory, writable.
    Workspace(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MountStep {
    kind: MountKind,
    target: PathBuf,
}

/// Mounts for an environment at `root`, in the order they are applied.
/// Host paths for which `present` is false are left out.
fn mount_plan(
    root: &Path,
    workdir: &Path,
    tmpfs_mb: u64,
    present: impl Fn(&Path) -> bool,
) -> Vec<MountStep> {
    let mut plan = vec![MountStep {
        kind: MountKind::Tmpfs(tmpfs_mb),
        target: root.to_path_buf(),
    }];
    for dir in SYSTEM_DIRS {
        let source = PathBuf::from(dir);
        if present(source.as_path()) {
            plan.push(MountStep {
                target: root.join(&dir[1..]),
                kind: MountKind::SystemDir(source),
            });
        }
    }
    for dev in DEVICES {
        let source = Path::new("/dev").join(dev);
        if present(source.as_path()) {
            plan.push(MountStep {
                target: root.join("dev").join(dev),
                kind: MountKind::Device(source),
            });
        }
    }
    plan.push(MountStep {
        kind: MountKind::Proc,
        target: root.join("proc"),
    });
    plan.push(MountStep {
        kind: MountKind::Workspace(workdir.to_path_buf()),
        target: root.join("workspace"),
    });
    plan
}

/// Every point a root may have mounted, innermost first.
fn unmount_order(root: &Path) -> Vec<PathBuf> {
    mount_plan(root, Path::new("/"), 0, |_| true)
        .into_iter()
        .rev()
        .map(|step| step.target)
        .collect()
}

fn apply(step: &MountStep) -> Result<(), String> {
    let target = step.target.as_path();
    match &step.kind {
        MountKind::Tmpfs(size_mb) => {
            fs::create_dir_all(target).map_err(|e| format!("mkdir root: {}", e))?;
            mount(
                Some("tmpfs"),
                target,
                Some("tmpfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                Some(format!("size={}M,mode=755", size_mb).as_str()),
            )
            .map_err(|e| format!("mount tmpfs: {}", e))?;
            let tmp = target.join("tmp");
            fs::create_dir_all(&tmp).map_err(|e| format!("mkdir tmp: {}", e))?;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o1777))
                .map_err(|e| format!("chmod tmp: {}", e))
        }
        MountKind::SystemDir(source) => {
            fs::create_dir_all(target).map_err(|e| format!("mkdir {}: {}", target.display(), e))?;
            bind(source, target, MsFlags::MS_REC)?;
            mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| format!("remount ro {}: {}", source.display(), e))
        }
        MountKind::Device(source) => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| format!("mkdir dev: {}", e))?;
            }
            fs::write(target, "").map_err(|e| format!("touch {}: {}", target.display(), e))?;
            bind(source, target, MsFlags::empty())
        }
        MountKind::Proc => {
            fs::create_dir_all(target).map_err(|e| format!("mkdir proc: {}", e))?;
            mount(
                Some("proc"),
                target,
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None::<&str>,
            )
            .map_err(|e| format!("mount proc: {}", e))
        }
        MountKind::Workspace(source) => {
            fs::create_dir_all(target).map_err(|e| format!("mkdir workspace: {}", e))?;
            bind(source, target, MsFlags::empty())
        }
    }
}

fn bind(source: &Path, target: &Path, extra: MsFlags) -> Result<(), String> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | extra,
        None::<&str>,
    )
    .map_err(|e| format!("bind mount {}: {}", source.display(), e))
}

fn setup_root(root: &Path, workdir: &Path, tmpfs_mb: u64) -> Result<(), String> {
    if root.exists() {
        cleanup_root(root);
    }
    for step in mount_plan(root, workdir, tmpfs_mb, Path::exists) {
        if let Err(e) = apply(&step) {
            cleanup_root(root);
            return Err(e);
        }
    }
    Ok(())
}

fn cleanup_root(root: &Path) {
    for target in unmount_order(root) {
        if target.exists() {
            if let Err(e) = umount2(&target, MntFlags::MNT_DETACH) {
                debug!(path = %target.display(), error = %e, "unmount skipped");
            }
        }
    }
    let _ = fs::remove_dir_all(root);
}

/// Ceilings set in the child before exec, with a label for error messages.
fn rlimits(limits: &Limits) -> [(Resource, u64, &'static str); 6] {
    [
        (Resource::RLIMIT_CPU, limits.cpu_secs.max(1), "cpu"),
        (Resource::RLIMIT_AS, limits.memory_mb * 1024 * 1024, "as"),
        (Resource::RLIMIT_FSIZE, limits.fsize_kb * 1024, "fsize"),
        (Resource::RLIMIT_NOFILE, limits.nofile, "nofile"),
        (Resource::RLIMIT_CORE, 0, "core"),
        (Resource::RLIMIT_NPROC, limits.pids, "nproc"),
    ]
}

/// Runs in the forked child before exec.
fn enter_root(root: &Path, limits: &Limits) -> Result<(), String> {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
    }
    unshare(CloneFlags::CLONE_NEWNET).map_err(|e| format!("unshare net: {}", e))?;
    chroot(root).map_err(|e| format!("chroot: {}", e))?;
    chdir("/workspace").map_err(|e| format!("chdir: {}", e))?;
    for (resource, value, label) in rlimits(limits) {
        setrlimit(resource, value, value).map_err(|e| format!("rlimit {}: {}", label, e))?;
    }
    setgid(Gid::from_raw(NOBODY_GID)).map_err(|e| format!("setgid: {}", e))?;
    setuid(Uid::from_raw(NOBODY_UID)).map_err(|e| format!("setuid: {}", e))?;
    Ok(())
}

pub struct NamespaceBackend {
    root_base: PathBuf,
    limits: Limits,
    live: Mutex<HashSet<String>>,
}

impl NamespaceBackend {
    pub fn new(root_base: impl Into<PathBuf>, limits: Limits) -> Self {
        Self {
            root_base: root_base.into(),
            limits,
            live: Mutex::new(HashSet::new()),
        }
    }

    fn root(&self, name: &str) -> PathBuf {
        self.root_base.join(name)
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SandboxBackend for NamespaceBackend {
    fn kind(&self) -> &'static str {
        "namespace"
    }

    async fn is_live(&self, name: &str) -> bool {
        self.live().contains(name) && self.root(name).join("workspace").exists()
    }

    async fn start(&self, name: &str, workdir: &Path) -> Result<(), SandboxError> {
        let root = self.root(name);
        let workdir = workdir.to_path_buf();
        let tmpfs_mb = self.limits.memory_mb.max(64);
        let result = tokio::task::spawn_blocking(move || setup_root(&root, &workdir, tmpfs_mb))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r);
        match result {
            Ok(()) => {
                self.live().insert(name.to_string());
                info!(env = %name, "namespace root ready");
                Ok(())
            }
            Err(message) => Err(SandboxError::Start {
                name: name.to_string(),
                message,
            }),
        }
    }

    async fn remove(&self, name: &str) {
        self.live().remove(name);
        let root = self.root(name);
        if let Err(e) = tokio::task::spawn_blocking(move || cleanup_root(&root)).await {
            warn!(env = %name, error = %e, "namespace cleanup task failed");
        }
    }

    fn spawn(
        &self,
        name: &str,
        _workdir: &Path,
        _tag: &str,
        command: &str,
    ) -> Result<Child, SandboxError> {
        let root = self.root(name);
        let limits = self.limits;
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", "/tmp")
            .env("LANG", "C.UTF-8");
        own_process_group(piped(&mut cmd));
        unsafe {
            cmd.pre_exec(move || enter_root(&root, &limits).map_err(std::io::Error::other));
        }
        cmd.spawn().map_err(|e| SandboxError::Exec {
            name: name.to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(plan: &[MountStep]) -> Vec<PathBuf> {
        plan.iter().map(|step| step.target.clone()).collect()
    }

    #[test]
    fn plan_mounts_root_first_and_workspace_last() {
        let root = Path::new("/var/lib/collabd/envs/collab-AB12CD");
        let plan = mount_plan(root, Path::new("/srv/work/AB12CD"), 256, |_| true);

        assert_eq!(plan[0].kind, MountKind::Tmpfs(256));
        assert_eq!(plan[0].target, root);
        let last = plan.last().unwrap();
        assert_eq!(last.kind, MountKind::Workspace(PathBuf::from("/srv/work/AB12CD")));
        assert_eq!(last.target, root.join("workspace"));
        assert!(plan.iter().any(|s| s.kind == MountKind::Proc && s.target == root.join("proc")));
        assert!(plan.iter().all(|s| s.target.starts_with(root)));
    }

    #[test]
    fn system_dirs_are_bound_at_the_same_path_inside_the_root() {
        let root = Path::new("/envs/x");
        let plan = mount_plan(root, Path::new("/w"), 64, |_| true);
        let usr = plan
            .iter()
            .find(|s| s.kind == MountKind::SystemDir(PathBuf::from("/usr")))
            .unwrap();
        assert_eq!(usr.target, Path::new("/envs/x/usr"));
        let null = plan
            .iter()
            .find(|s| s.kind == MountKind::Device(PathBuf::from("/dev/null")))
            .unwrap();
        assert_eq!(null.target, Path::new("/envs/x/dev/null"));
    }

    #[test]
    fn missing_host_paths_are_left_out() {
        let root = Path::new("/envs/x");
        let plan = mount_plan(root, Path::new("/w"), 64, |p| p != Path::new("/lib64"));
        assert!(!targets(&plan).contains(&root.join("lib64")));
        assert!(targets(&plan).contains(&root.join("lib")));
    }

    #[test]
    fn unmounting_reverses_the_plan_and_ends_at_the_root() {
        let root = Path::new("/envs/x");
        let order = unmount_order(root);
        assert_eq!(order.first(), Some(&root.join("workspace")));
        assert_eq!(order.last(), Some(&root.to_path_buf()));

        let mut forward = targets(&mount_plan(root, Path::new("/w"), 64, |_| true));
        forward.reverse();
        assert_eq!(order, forward);
    }

    #[test]
    fn rlimits_follow_configured_limits() {
        let limits = Limits {
            cpu_secs: 0,
            memory_mb: 128,
            ..Limits::default()
        };
        let table = rlimits(&limits);
        let value = |resource| {
            table
                .iter()
                .find(|(r, _, _)| *r == resource)
                .map(|(_, v, _)| *v)
                .unwrap()
        };
        assert_eq!(value(Resource::RLIMIT_CPU), 1);
        assert_eq!(value(Resource::RLIMIT_AS), 128 * 1024 * 1024);
        assert_eq!(value(Resource::RLIMIT_FSIZE), limits.fsize_kb * 1024);
        assert_eq!(value(Resource::RLIMIT_NOFILE), limits.nofile);
        assert_eq!(value(Resource::RLIMIT_CORE), 0);
        assert_eq!(value(Resource::RLIMIT_NPROC), limits.pids);
    }

    #[tokio::test]
    #[ignore = "needs root with CAP_SYS_ADMIN"]
    async fn runs_a_program_without_network() {
        let base = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let backend = NamespaceBackend::new(base.path(), Limits::default());
        backend.start("ns-test", workdir.path()).await.unwrap();
        assert!(backend.is_live("ns-test").await);

        let child = backend
            .spawn(
                "ns-test",
                workdir.path(),
                "1-1",
                "pwd; grep -c : /proc/net/dev",
            )
            .unwrap();
        let output = child.wait_with_output().await.unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.starts_with("/workspace\n"));
        // Only loopback is visible.
        assert!(stdout.ends_with("\n1\n"));

        backend.remove("ns-test").await;
        assert!(!backend.is_live("ns-test").await);
        assert!(!base.path().join("ns-test").exists());
    }
}
