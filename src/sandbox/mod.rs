//! Per-room execution environments and the programs running inside them.
//!
//! Each room gets one long-lived environment. Starting it is the slow part,
//! so it is created on the first run and reused afterwards; a run only execs
//! a command inside it. Each connection owns at most one foreground process.

mod docker;
#[cfg(target_os = "linux")]
mod namespace;

pub use docker::DockerBackend;
#[cfg(target_os = "linux")]
pub use namespace::NamespaceBackend;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::connections::ConnId;
use crate::error::SandboxError;

/// Resource ceilings applied to every environment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids: u64,
    /// CPU-time ceiling per process, for backends that enforce it via rlimit.
    pub cpu_secs: u64,
    pub nofile: u64,
    pub fsize_kb: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            cpus: 0.5,
            pids: 64,
            cpu_secs: 60,
            nofile: 256,
            fsize_kb: 10240,
        }
    }
}

/// Source file name and shell command for a language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageSpec {
    pub file: &'static str,
    pub command: &'static str,
}

pub fn language_spec(language: &str) -> Option<LanguageSpec> {
    let spec = |file, command| Some(LanguageSpec { file, command });
    match language.to_ascii_lowercase().as_str() {
        "javascript" | "js" | "node" => spec("main.js", "node main.js"),
        "typescript" | "ts" => spec("main.ts", "npx tsx main.ts"),
        "python" | "py" | "python3" => spec("main.py", "python3 -u main.py"),
        "c" => spec("main.c", "gcc -O2 -o main main.c && ./main"),
        "cpp" | "c++" => spec("main.cpp", "g++ -O2 -o main main.cpp && ./main"),
        "java" => spec("Main.java", "javac Main.java && java Main"),
        "go" | "golang" => spec("main.go", "go run main.go"),
        "rust" | "rs" => spec("main.rs", "rustc -O -o main main.rs && ./main"),
        "bash" | "shell" | "sh" => spec("main.sh", "bash main.sh"),
        "ruby" | "rb" => spec("main.rb", "ruby main.rb"),
        "php" => spec("main.php", "php main.php"),
        _ => None,
    }
}

/// Progress of a run, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// A new environment was started for this run.
    EnvironmentStarted,
    Running { command: String },
    Stdout(String),
    Stderr(String),
    Exit { code: Option<i32> },
    /// The run could not be started.
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Started,
    Reused,
}

/// A way of hosting environments.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn is_live(&self, name: &str) -> bool;

    /// Starts `name` with `workdir` mounted as its working directory.
    async fn start(&self, name: &str, workdir: &Path) -> Result<(), SandboxError>;

    /// Force-removes `name`; a missing environment is not an error.
    async fn remove(&self, name: &str);

    /// Launches `command` inside the running environment with piped stdio.
    fn spawn(
        &self,
        name: &str,
        workdir: &Path,
        tag: &str,
        command: &str,
    ) -> Result<Child, SandboxError>;

    /// Kills the process tree started under `tag`.
    async fn interrupt(&self, _name: &str, _tag: &str, pid: Option<u32>) {
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
    }
}

/// The foreground process of one connection.
///
/// Dropping the handle drops `kill`, which makes the waiter task kill the
/// process; removing a handle from the table is therefore enough to stop it.
/// Input goes through `input` to a writer task that owns the pipe, so a
/// program that never reads cannot stall anyone else.
struct RunHandle {
    id: u64,
    room: String,
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
    kill: Option<oneshot::Sender<()>>,
}

impl RunHandle {
    fn signal(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

#[derive(Debug)]
struct EnvSlot {
    live: bool,
    /// Set once the slot has been taken out of the table; holders must look
    /// the room up again.
    retired: bool,
    last_used: Instant,
}

impl Default for EnvSlot {
    fn default() -> Self {
        Self {
            live: false,
            retired: false,
            last_used: Instant::now(),
        }
    }
}

pub struct SandboxManager {
    backend: Arc<dyn SandboxBackend>,
    workdir_root: PathBuf,
    prefix: String,
    envs: Mutex<HashMap<String, Arc<Mutex<EnvSlot>>>>,
    runs: Arc<Mutex<HashMap<ConnId, RunHandle>>>,
    next_run: AtomicU64,
}

impl SandboxManager {
    pub fn new(backend: Arc<dyn SandboxBackend>, workdir_root: PathBuf, prefix: &str) -> Self {
        Self {
            backend,
            workdir_root,
            prefix: prefix.to_string(),
            envs: Mutex::new(HashMap::new()),
            runs: Arc::new(Mutex::new(HashMap::new())),
            next_run: AtomicU64::new(0),
        }
    }

    /// Room ids are case-sensitive, and so are environment names.
    pub fn env_name(&self, room: &str) -> String {
        format!("{}{}", self.prefix, room)
    }

    pub fn workdir(&self, room: &str) -> PathBuf {
        self.workdir_root.join(room)
    }

    /// Makes sure the room's environment is running. Concurrent calls for the
    /// same room queue behind one another, so only one start ever happens.
    pub async fn ensure(&self, room: &str) -> Result<EnsureOutcome, SandboxError> {
        loop {
            let slot = self.envs.lock().await.entry(room.to_string()).or_default().clone();
            let mut slot = slot.lock().await;
            if slot.retired {
                continue;
            }
            slot.last_used = Instant::now();
            return self.start_in(room, &mut slot).await;
        }
    }

    async fn start_in(&self, room: &str, slot: &mut EnvSlot) -> Result<EnsureOutcome, SandboxError> {
        let name = self.env_name(room);
        if slot.live && self.backend.is_live(&name).await {
            return Ok(EnsureOutcome::Reused);
        }

        // Whatever is left under this name is stale.
        self.backend.remove(&name).await;
        slot.live = false;

        let workdir = self.workdir(room);
        tokio::fs::create_dir_all(&workdir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&workdir, std::fs::Permissions::from_mode(0o777)).await?;
        }

        info!(room = %room, env = %name, backend = self.backend.kind(), "starting execution environment");
        if let Err(e) = self.backend.start(&name, &workdir).await {
            warn!(room = %room, error = %e, "execution environment failed to start");
            self.backend.remove(&name).await;
            let _ = tokio::fs::remove_dir_all(&workdir).await;
            return Err(e);
        }
        slot.live = true;
        Ok(EnsureOutcome::Started)
    }

    /// Writes `source` into the room's working directory and runs it.
    ///
    /// Any previous run of `conn` is stopped first. Progress goes to
    /// `events`; the returned id identifies this run.
    pub async fn run(
        &self,
        room: &str,
        conn: ConnId,
        language: &str,
        source: &str,
        events: mpsc::UnboundedSender<RunEvent>,
    ) -> Result<u64, SandboxError> {
        let spec = language_spec(language)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(language.to_string()))?;

        self.stop(conn).await;

        if self.ensure(room).await? == EnsureOutcome::Started {
            let _ = events.send(RunEvent::EnvironmentStarted);
        }

        let workdir = self.workdir(room);
        tokio::fs::write(workdir.join(spec.file), source).await?;

        let name = self.env_name(room);
        let id = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
        let tag = format!("{conn}-{id}");
        let _ = events.send(RunEvent::Running {
            command: spec.command.to_string(),
        });

        let mut child = self.backend.spawn(&name, &workdir, &tag, spec.command)?;
        let pid = child.id();
        debug!(room = %room, conn = %conn, run = id, pid = ?pid, "program launched");

        let input = child.stdin.take().map(spawn_writer);
        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(pump(out, events.clone(), RunEvent::Stdout))
        });
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(pump(err, events.clone(), RunEvent::Stderr))
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        self.runs.lock().await.insert(
            conn,
            RunHandle {
                id,
                room: room.to_string(),
                input,
                kill: Some(kill_tx),
            },
        );

        let runs = self.runs.clone();
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    backend.interrupt(&name, &tag, pid).await;
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            for pump in [stdout, stderr].into_iter().flatten() {
                if tokio::time::timeout(Duration::from_secs(2), pump).await.is_err() {
                    debug!(run = id, "output pump still open after exit");
                }
            }

            let code = status.ok().and_then(|s| s.code());
            let _ = events.send(RunEvent::Exit { code });

            let mut runs = runs.lock().await;
            if runs.get(&conn).is_some_and(|run| run.id == id) {
                runs.remove(&conn);
            }
        });

        Ok(id)
    }

    /// Queues `text` for the foreground process of `conn`. Returns without
    /// waiting for the program to read it.
    pub async fn send_input(&self, conn: ConnId, text: &str) -> Result<(), SandboxError> {
        let input = self
            .runs
            .lock()
            .await
            .get(&conn)
            .and_then(|run| run.input.clone())
            .ok_or(SandboxError::NotRunning)?;
        input
            .send(normalize_input(text).into_bytes())
            .map_err(|_| SandboxError::NotRunning)
    }

    /// Signals the foreground process of `conn`. The environment keeps
    /// running; the exit is reported through the run's events.
    pub async fn stop(&self, conn: ConnId) -> bool {
        match self.runs.lock().await.remove(&conn) {
            Some(mut run) => {
                debug!(conn = %conn, run = run.id, "stopping program");
                run.signal();
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, conn: ConnId) -> bool {
        self.runs.lock().await.contains_key(&conn)
    }

    /// Stops every program in the room, removes its environment and deletes
    /// its working directory.
    pub async fn teardown(&self, room: &str) {
        self.stop_room(room).await;
        let slot = self.envs.lock().await.remove(room);
        match slot {
            Some(slot) => {
                let mut slot = slot.lock().await;
                slot.retired = true;
                slot.live = false;
                self.dispose(room).await;
            }
            None => self.dispose(room).await,
        }
    }

    /// Tears the room's environment down if it is still idle once its slot
    /// is locked. A run that started after the room was listed as idle keeps
    /// its environment.
    pub async fn reap_if_idle(&self, room: &str, ttl: Duration) -> bool {
        let Some(slot) = self.envs.lock().await.get(room).cloned() else {
            return false;
        };
        let mut guard = slot.lock().await;
        if guard.retired || guard.last_used.elapsed() <= ttl || self.room_busy(room).await {
            return false;
        }
        guard.retired = true;
        guard.live = false;
        {
            let mut envs = self.envs.lock().await;
            if envs.get(room).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                envs.remove(room);
            }
        }
        self.dispose(room).await;
        true
    }

    async fn room_busy(&self, room: &str) -> bool {
        self.runs.lock().await.values().any(|run| run.room == room)
    }

    async fn stop_room(&self, room: &str) {
        let mut runs = self.runs.lock().await;
        runs.retain(|_, run| {
            if run.room == room {
                run.signal();
                false
            } else {
                true
            }
        });
    }

    async fn dispose(&self, room: &str) {
        let name = self.env_name(room);
        self.backend.remove(&name).await;
        match tokio::fs::remove_dir_all(self.workdir(room)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(room = %room, error = %e, "failed to delete working directory"),
        }
        info!(room = %room, env = %name, "execution environment torn down");
    }

    /// Rooms whose environment has had no activity for `ttl` and nothing
    /// running.
    pub async fn idle_environments(&self, ttl: Duration) -> Vec<String> {
        let busy: Vec<String> = self
            .runs
            .lock()
            .await
            .values()
            .map(|run| run.room.clone())
            .collect();
        let envs = self.envs.lock().await;
        envs.iter()
            .filter(|(room, _)| !busy.contains(room))
            .filter(|(_, slot)| {
                slot.try_lock()
                    .map(|slot| slot.last_used.elapsed() > ttl)
                    .unwrap_or(false)
            })
            .map(|(room, _)| room.clone())
            .collect()
    }
}

/// Owns the program's stdin and writes whatever is queued for it. Ends when
/// the run handle is dropped or the pipe breaks.
fn spawn_writer(mut stdin: ChildStdin) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = write_chunk(&mut stdin, &bytes).await {
                debug!(error = %e, "program input closed");
                break;
            }
        }
    });
    tx
}

async fn write_chunk(stdin: &mut ChildStdin, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

/// Turns a bare carriage return, as sent by terminal emulators on Enter,
/// into the line feed a pipe reader expects.
pub fn normalize_input(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

async fn pump<R>(mut reader: R, events: mpsc::UnboundedSender<RunEvent>, wrap: fn(String) -> RunEvent)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_utf8(&mut pending);
                if !text.is_empty() && events.send(wrap(text)).is_err() {
                    break;
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = events.send(wrap(String::from_utf8_lossy(&pending).into_owned()));
    }
}

/// Drains the decodable prefix of `pending`, keeping an incomplete trailing
/// sequence for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let rest = pending.split_off(valid);
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

/// Puts the child in its own process group so the whole tree can be killed.
fn own_process_group(command: &mut Command) {
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            if libc::setpgid(0, 0) == 0 {
                Ok(())
            } else {
                Err(std::io::Error::last_os_error())
            }
        });
    }
}

fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

fn piped(command: &mut Command) -> &mut Command {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
}


#[cfg(test)]
mod tests {
    use super::testing::LocalBackend;
    use super::*;

    fn manager(backend: Arc<LocalBackend>, dir: &Path) -> SandboxManager {
        SandboxManager::new(backend, dir.to_path_buf(), "test-")
    }

    async fn collect_until_exit(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("run did not finish")
                .expect("event channel closed");
            let done = matches!(event, RunEvent::Exit { .. });
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn stdout_of(events: &[RunEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Stdout(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn knows_common_languages() {
        assert_eq!(language_spec("Python").unwrap().file, "main.py");
        assert_eq!(language_spec("javascript").unwrap().command, "node main.js");
        assert_eq!(language_spec("ts").unwrap().command, "npx tsx main.ts");
        assert!(language_spec("cobol").is_none());
    }

    #[test]
    fn carriage_returns_become_line_feeds() {
        assert_eq!(normalize_input("\r"), "\n");
        assert_eq!(normalize_input("abc\r"), "abc\n");
        assert_eq!(normalize_input("a\r\nb"), "a\nb");
        assert_eq!(normalize_input("plain"), "plain");
    }

    #[test]
    fn utf8_split_across_reads_is_reassembled() {
        let bytes = "é".as_bytes();
        let mut pending = vec![b'a', bytes[0]];
        assert_eq!(take_utf8(&mut pending), "a");
        pending.push(bytes[1]);
        assert_eq!(take_utf8(&mut pending), "é");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn concurrent_ensure_starts_one_environment() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::default());
        let manager = Arc::new(manager(backend.clone(), dir.path()));

        let a = tokio::spawn({
            let manager = manager.clone();
            async move { manager.ensure("ROOM1").await.unwrap() }
        });
        let b = tokio::spawn({
            let manager = manager.clone();
            async move { manager.ensure("ROOM1").await.unwrap() }
        });
        let mut outcomes = vec![a.await.unwrap(), b.await.unwrap()];
        outcomes.sort_by_key(|o| *o == EnsureOutcome::Reused);

        assert_eq!(outcomes, vec![EnsureOutcome::Started, EnsureOutcome::Reused]);
        assert_eq!(backend.starts(), 1);
    }

    #[tokio::test]
    async fn first_run_announces_startup_and_second_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::default());
        let manager = manager(backend.clone(), dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager
            .run("ROOM1", ConnId(1), "bash", "echo hello", tx.clone())
            .await
            .unwrap();
        let first = collect_until_exit(&mut rx).await;
        assert_eq!(first[0], RunEvent::EnvironmentStarted);
        assert!(matches!(first[1], RunEvent::Running { .. }));
        assert_eq!(stdout_of(&first), "hello\n");
        assert_eq!(first.last(), Some(&RunEvent::Exit { code: Some(0) }));

        manager
            .run("ROOM1", ConnId(1), "bash", "exit 3", tx)
            .await
            .unwrap();
        let second = collect_until_exit(&mut rx).await;
        assert!(matches!(second[0], RunEvent::Running { .. }));
        assert!(!second.contains(&RunEvent::EnvironmentStarted));
        assert_eq!(second.last(), Some(&RunEvent::Exit { code: Some(3) }));
        assert_eq!(backend.starts(), 1);
    }

    #[tokio::test]
    async fn stderr_is_reported_separately() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Arc::new(LocalBackend::default()), dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .run("ROOM1", ConnId(1), "bash", "echo oops >&2", tx)
            .await
            .unwrap();
        let events = collect_until_exit(&mut rx).await;
        assert!(events.contains(&RunEvent::Stderr("oops\n".to_string())));
    }

    #[tokio::test]
    async fn input_reaches_the_program() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Arc::new(LocalBackend::default()), dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .run("ROOM1", ConnId(1), "bash", "read name; echo \"hi $name\"", tx)
            .await
            .unwrap();
        manager.send_input(ConnId(1), "ada").await.unwrap();
        manager.send_input(ConnId(1), "\r").await.unwrap();
        let events = collect_until_exit(&mut rx).await;
        assert_eq!(stdout_of(&events), "hi ada\n");
    }

    #[tokio::test]
    async fn unread_input_does_not_stall_other_rooms() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(Arc::new(LocalBackend::default()), dir.path()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .run("ROOM1", ConnId(1), "bash", "sleep 30", tx.clone())
            .await
            .unwrap();

        // Far more than a pipe buffer holds; the program never reads it.
        let flood = "x".repeat(1 << 20);
        tokio::time::timeout(Duration::from_secs(3), manager.send_input(ConnId(1), &flood))
            .await
            .expect("send_input waited on the program")
            .unwrap();

        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        tokio::time::timeout(
            Duration::from_secs(3),
            manager.run("ROOM2", ConnId(2), "bash", "echo hi", other_tx),
        )
        .await
        .expect("run in another room blocked")
        .unwrap();
        assert_eq!(stdout_of(&collect_until_exit(&mut other_rx).await), "hi\n");

        let stopped = tokio::time::timeout(Duration::from_secs(3), manager.stop(ConnId(1)))
            .await
            .expect("stop blocked");
        assert!(stopped);
        let events = collect_until_exit(&mut rx).await;
        assert_eq!(events.last(), Some(&RunEvent::Exit { code: None }));
        assert!(matches!(
            manager.send_input(ConnId(1), "late").await,
            Err(SandboxError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn stop_kills_the_foreground_process_only() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::default());
        let manager = manager(backend.clone(), dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .run("ROOM1", ConnId(1), "bash", "sleep 30", tx)
            .await
            .unwrap();
        assert!(manager.is_running(ConnId(1)).await);

        assert!(manager.stop(ConnId(1)).await);
        assert!(!manager.is_running(ConnId(1)).await);
        let events = collect_until_exit(&mut rx).await;
        assert_eq!(events.last(), Some(&RunEvent::Exit { code: None }));

        assert_eq!(manager.ensure("ROOM1").await.unwrap(), EnsureOutcome::Reused);
        assert!(!manager.stop(ConnId(1)).await);
    }

    #[tokio::test]
    async fn new_run_replaces_previous_one_for_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Arc::new(LocalBackend::default()), dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = manager
            .run("ROOM1", ConnId(1), "bash", "sleep 30", tx.clone())
            .await
            .unwrap();
        let second = manager
            .run("ROOM1", ConnId(1), "bash", "echo second", tx)
            .await
            .unwrap();
        assert_ne!(first, second);

        let mut exits = 0;
        let mut output = String::new();
        while exits < 2 {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap() {
                RunEvent::Exit { .. } => exits += 1,
                RunEvent::Stdout(s) => output.push_str(&s),
                _ => {}
            }
        }
        assert_eq!(output, "second\n");
    }

    #[tokio::test]
    async fn start_failure_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Arc::new(LocalBackend::failing()), dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = manager
            .run("ROOM1", ConnId(1), "bash", "echo never", tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Start { .. }));
        assert!(!manager.is_running(ConnId(1)).await);
        assert!(!dir.path().join("ROOM1").exists());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected_before_starting() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::default());
        let manager = manager(backend.clone(), dir.path());
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = manager
            .run("ROOM1", ConnId(1), "cobol", "", tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
        assert_eq!(backend.starts(), 0);
    }

    #[tokio::test]
    async fn teardown_removes_environment_and_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::default());
        let manager = manager(backend.clone(), dir.path());
        manager.ensure("ROOM1").await.unwrap();
        assert!(dir.path().join("ROOM1").exists());

        manager.teardown("ROOM1").await;
        assert!(!dir.path().join("ROOM1").exists());
        assert!(!backend.is_live("test-ROOM1").await);
        assert_eq!(manager.ensure("ROOM1").await.unwrap(), EnsureOutcome::Started);
        assert_eq!(backend.starts(), 2);
    }

    #[tokio::test]
    async fn idle_environments_respect_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Arc::new(LocalBackend::default()), dir.path());
        manager.ensure("ROOM1").await.unwrap();
        assert!(manager.idle_environments(Duration::from_secs(60)).await.is_empty());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            manager.idle_environments(Duration::from_millis(10)).await,
            vec!["ROOM1".to_string()]
        );
    }

    #[tokio::test]
    async fn reaping_skips_an_environment_used_after_listing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::default());
        let manager = manager(backend.clone(), dir.path());
        let ttl = Duration::from_millis(50);
        manager.ensure("ROOM1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(manager.idle_environments(ttl).await, vec!["ROOM1".to_string()]);

        // A join and run land between listing and reaping.
        assert_eq!(manager.ensure("ROOM1").await.unwrap(), EnsureOutcome::Reused);
        assert!(!manager.reap_if_idle("ROOM1", ttl).await);
        assert!(backend.is_live("test-ROOM1").await);
        assert!(dir.path().join("ROOM1").exists());
    }

    #[tokio::test]
    async fn reaping_skips_a_room_with_a_running_program() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Arc::new(LocalBackend::default()), dir.path());
        let (tx, _rx) = mpsc::unbounded_channel();
        manager
            .run("ROOM1", ConnId(1), "bash", "sleep 30", tx)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!manager.reap_if_idle("ROOM1", Duration::from_millis(10)).await);
        assert!(manager.is_running(ConnId(1)).await);
        manager.stop(ConnId(1)).await;
    }

    #[tokio::test]
    async fn reaped_environment_is_started_again_on_next_use() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::default());
        let manager = manager(backend.clone(), dir.path());
        manager.ensure("ROOM1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(manager.reap_if_idle("ROOM1", Duration::from_millis(10)).await);
        assert!(!backend.is_live("test-ROOM1").await);
        assert!(!dir.path().join("ROOM1").exists());
        assert!(!manager.reap_if_idle("ROOM1", Duration::from_millis(10)).await);

        assert_eq!(manager.ensure("ROOM1").await.unwrap(), EnsureOutcome::Started);
        assert_eq!(backend.starts(), 2);
    }
}
