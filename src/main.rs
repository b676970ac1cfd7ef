//! collabd - collaborative code rooms with sandboxed execution.
//!
//! Usage:
//!   collabd serve [--port 3000] [--data-dir DIR] [--users FILE]   # Start the server
//!   collabd exec --language python main.py                        # Run one file and exit

use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use collabd::config::{BackendKind, Config, DEFAULT_ENV_IDLE_SECS, DEFAULT_FLUSH_SECS};
use collabd::connections::ConnId;
use collabd::http_server::run_server;
use collabd::persistence::{
    IdentityResolver, JsonDirRepository, MemoryRepository, RoomRepository, TokenTable,
};
use collabd::sandbox::{DockerBackend, RunEvent, SandboxBackend, SandboxManager};
use collabd::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "collabd")]
#[command(about = "Collaborative code rooms with sandboxed execution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct SandboxArgs {
    /// Execution backend
    #[arg(long, value_enum, default_value = "docker")]
    backend: BackendKind,

    /// Image for the docker backend
    #[arg(long, default_value = "collabd-runner:latest")]
    image: String,

    /// Memory limit per environment in MB
    #[arg(long, default_value = "256")]
    memory: u64,

    /// CPU share per environment
    #[arg(long, default_value = "0.5")]
    cpus: f64,

    /// Maximum number of processes per environment
    #[arg(long, default_value = "64")]
    pids: u64,

    /// CPU time limit per program in seconds (namespace backend)
    #[arg(long, default_value = "60")]
    cpu_secs: u64,

    /// Parent directory for per-room working directories
    #[arg(long)]
    workdir: Option<PathBuf>,
}

impl SandboxArgs {
    fn apply(self, config: &mut Config) {
        config.backend = self.backend;
        config.image = self.image;
        config.limits.memory_mb = self.memory;
        config.limits.cpus = self.cpus;
        config.limits.pids = self.pids;
        config.limits.cpu_secs = self.cpu_secs;
        if let Some(workdir) = self.workdir {
            config.workdir_root = workdir;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "3000")]
        port: u16,

        /// Seconds between room flushes
        #[arg(long, default_value_t = DEFAULT_FLUSH_SECS)]
        flush_secs: u64,

        /// Directory for room records (in memory when omitted)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// JSON token table: { "<token>": { "id": ..., "name": ... } }
        #[arg(long)]
        users: Option<PathBuf>,

        /// Seconds an unused environment is kept after its room closes
        #[arg(long, default_value_t = DEFAULT_ENV_IDLE_SECS)]
        env_idle_secs: u64,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },
    /// Run a single source file in a fresh environment
    Exec {
        /// Language of the file
        #[arg(long, short)]
        language: String,

        /// Source file to run
        file: PathBuf,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::default();

    match cli.command {
        Commands::Serve {
            port,
            flush_secs,
            data_dir,
            users,
            env_idle_secs,
            sandbox,
        } => {
            config.port = port;
            config.flush_interval = Duration::from_secs(flush_secs.max(1));
            config.data_dir = data_dir;
            config.users = users;
            config.env_idle_ttl = Duration::from_secs(env_idle_secs);
            sandbox.apply(&mut config);
            if let Err(e) = serve(config).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Exec {
            language,
            file,
            sandbox,
        } => {
            sandbox.apply(&mut config);
            match exec(config, &language, &file).await {
                Ok(code) => exit(code),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
    }
}

fn build_backend(config: &Config) -> Result<Arc<dyn SandboxBackend>, String> {
    match config.backend {
        BackendKind::Docker => Ok(Arc::new(DockerBackend::new(config.image.clone(), config.limits))),
        BackendKind::Namespace => namespace_backend(config),
    }
}

#[cfg(target_os = "linux")]
fn namespace_backend(config: &Config) -> Result<Arc<dyn SandboxBackend>, String> {
    if !nix::unistd::geteuid().is_root() {
        return Err("the namespace backend must run as root (needs CAP_SYS_ADMIN)".to_string());
    }
    Ok(Arc::new(collabd::sandbox::NamespaceBackend::new(
        config.env_root.clone(),
        config.limits,
    )))
}

#[cfg(not(target_os = "linux"))]
fn namespace_backend(_config: &Config) -> Result<Arc<dyn SandboxBackend>, String> {
    Err("the namespace backend only works on Linux".to_string())
}

async fn serve(config: Config) -> Result<(), String> {
    let config = config
        .resolve_paths()
        .map_err(|e| format!("resolve directories: {}", e))?;

    let repository: Arc<dyn RoomRepository> = match &config.data_dir {
        Some(dir) => {
            let repository = JsonDirRepository::open(dir.clone())
                .await
                .map_err(|e| format!("open {}: {}", dir.display(), e))?;
            info!(dir = %dir.display(), "room records on disk");
            Arc::new(repository)
        }
        None => {
            warn!("no --data-dir given, rooms live in memory only");
            Arc::new(MemoryRepository::default())
        }
    };

    let identity: Arc<dyn IdentityResolver> = match &config.users {
        Some(path) => {
            let table = TokenTable::load(path)
                .await
                .map_err(|e| format!("load {}: {}", path.display(), e))?;
            info!(tokens = table.len(), "identity table loaded");
            Arc::new(table)
        }
        None => {
            warn!("no --users table given, every connection is anonymous");
            Arc::new(TokenTable::default())
        }
    };

    let backend = build_backend(&config)?;
    info!(backend = backend.kind(), "execution backend ready");
    let sandbox = SandboxManager::new(backend, config.workdir_root.clone(), &config.env_prefix);
    let state = AppState::new(config, repository, identity, sandbox);
    run_server(state).await.map_err(|e| format!("server: {}", e))
}

/// Runs `file` in a throwaway environment, streaming its output, and
/// returns its exit code.
async fn exec(config: Config, language: &str, file: &Path) -> Result<i32, String> {
    let source = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| format!("read {}: {}", file.display(), e))?;
    let config = config
        .resolve_paths()
        .map_err(|e| format!("resolve directories: {}", e))?;
    let backend = build_backend(&config)?;
    let sandbox = SandboxManager::new(backend, config.workdir_root.clone(), &config.env_prefix);

    let room = format!("exec-{}", uuid::Uuid::new_v4().simple());
    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Err(e) = sandbox.run(&room, ConnId(0), language, &source, tx).await {
        sandbox.teardown(&room).await;
        return Err(e.to_string());
    }

    let mut code = 1;
    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::Stdout(text) => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            RunEvent::Stderr(text) => eprint!("{}", text),
            RunEvent::Exit { code: exit_code } => {
                code = exit_code.unwrap_or(1);
                break;
            }
            other => debug!(event = ?other, "run progress"),
        }
    }

    sandbox.teardown(&room).await;
    Ok(code)
}
