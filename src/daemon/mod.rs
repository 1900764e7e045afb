pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod recovery;
pub mod store;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::daemon::events::JobEvent;
use crate::daemon::executor::Executor;
use crate::daemon::orchestrator::Orchestrator;
use crate::daemon::recovery::{RecoveryReport, RecoveryScanner};
use crate::daemon::store::JobRecordStore;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::models::DaemonConfig;
use crate::server::{self, AppState};
use crate::storage::payloads::FsPayloadStore;
use crate::storage::records::FsRecordStore;
use crate::storage::RecordStore;

const APP_DIR: &str = "resource-downloader";
const PID_FILE: &str = "rdl.pid";

// ---------------------------------------------------------------------------
// PidFile: one daemon per data directory
// ---------------------------------------------------------------------------

/// Lock file holding the daemon's PID, so two daemons never share a data
/// directory. A file naming a dead process (or no process at all) is stale
/// and gets replaced.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// PID recorded in the file, if it exists and is readable.
    pub fn holder(&self) -> Option<u32> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    /// Take the lock for this process.
    pub fn acquire(&self) -> Result<()> {
        let pid = std::process::id();
        // Second pass only runs after a stale file was cleared.
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    writeln!(file, "{}", pid)
                        .and_then(|_| file.sync_all())
                        .with_context(|| format!("Failed to write {}", self.path.display()))?;
                    tracing::info!("Holding {} as PID {}", self.path.display(), pid);
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match self.holder() {
                        Some(holder) if holder != pid && is_process_alive(holder) => {
                            anyhow::bail!(
                                "Daemon is already running (PID {}). PID file: {}",
                                holder,
                                self.path.display()
                            );
                        }
                        Some(holder) if holder == pid => {
                            anyhow::bail!(
                                "Daemon is already running in this process. PID file: {}",
                                self.path.display()
                            );
                        }
                        holder => {
                            tracing::warn!(
                                "Clearing stale PID file {} (holder {:?})",
                                self.path.display(),
                                holder
                            );
                            match std::fs::remove_file(&self.path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                                Err(e) => {
                                    return Err(e).context("Failed to clear stale PID file")
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create {}", self.path.display()))
                }
            }
        }
        anyhow::bail!(
            "Another daemon raced for {}; try again",
            self.path.display()
        )
    }

    /// Drop the lock, but only if this process still holds it.
    pub fn release(&self) -> Result<()> {
        if self.holder() != Some(std::process::id()) {
            return Ok(());
        }
        std::fs::remove_file(&self.path).context("Failed to remove PID file")?;
        tracing::info!("Released {}", self.path.display());
        Ok(())
    }

    /// Whether the file names a running process.
    pub fn is_alive(&self) -> bool {
        self.holder().is_some_and(is_process_alive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether `pid` names a running process.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // Signal 0 only checks for existence; EPERM still means it exists.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

fn read_config_file(path: &Path) -> Result<DaemonConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: DaemonConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Load the DaemonConfig. The first file found wins:
///   1. `config_path` (the --config flag); missing is an error
///   2. `$RDL_CONFIG_DIR/config.json`
///   3. platform config dir, `resource-downloader/config.json`
///   4. `{data_dir}/config.json`
///
/// With no file at all, defaults are used.
pub fn load_config(config_path: Option<&Path>) -> Result<DaemonConfig> {
    if let Some(path) = config_path {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        return read_config_file(path);
    }

    let mut candidates = Vec::new();
    if let Ok(config_dir) = std::env::var("RDL_CONFIG_DIR") {
        candidates.push(PathBuf::from(config_dir).join("config.json"));
    }
    if let Some(config_dir) = dirs::config_dir() {
        candidates.push(config_dir.join(APP_DIR).join("config.json"));
    }
    candidates.push(resolve_data_dir(None).join("config.json"));

    for path in candidates {
        if path.exists() {
            return read_config_file(&path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(DaemonConfig::default())
}

/// Resolve the data directory: `override_dir`, then `$RDL_DATA_DIR`, then
/// the platform data dir (`~/.local/share/resource-downloader` on Linux).
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(d) = std::env::var("RDL_DATA_DIR") {
        return PathBuf::from(d);
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Create the required data directories under `data_dir`.
pub async fn create_data_dirs(data_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(data_dir.join("requests"))
        .await
        .context("Failed to create requests directory")?;
    tracing::info!("Data directories ensured at: {}", data_dir.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Runtime bootstrap
// ---------------------------------------------------------------------------

/// The running job machinery: store writer, orchestrator and event channel.
pub struct Runtime {
    pub orchestrator: Arc<Orchestrator>,
    pub event_tx: broadcast::Sender<JobEvent>,
    pub recovered: usize,
    writer: JoinHandle<()>,
}

impl Runtime {
    /// Cancel in-flight fetches, drain the store queue and stop the writer.
    pub async fn shutdown(self) {
        tracing::info!("Beginning graceful shutdown sequence...");
        self.orchestrator.shutdown().await;
        self.writer.abort();
        tracing::info!("Job runtime stopped");
    }
}

/// Recover state from `data_dir` and start the job machinery.
///
/// Incomplete jobs found on disk are relaunched before this returns.
pub async fn bootstrap(
    config: Arc<DaemonConfig>,
    data_dir: &Path,
    fetcher: Arc<dyn Fetcher>,
) -> Result<Runtime> {
    let records = Arc::new(FsRecordStore::new(data_dir.to_path_buf()).await?)
        as Arc<dyn RecordStore>;

    let RecoveryReport {
        records: known,
        incomplete,
        next_id,
        ..
    } = RecoveryScanner::new(Arc::clone(&records), config.recovery_policy)
        .scan()
        .await
        .context("Recovery scan failed")?;

    let (event_tx, _event_rx) = broadcast::channel::<JobEvent>(config.broadcast_capacity.max(1));
    let (store, writer) = JobRecordStore::spawn(records, known, event_tx.clone(), &config);

    let executor = Executor::new(
        store.clone(),
        fetcher,
        Arc::new(FsPayloadStore::new(data_dir)),
        Arc::clone(&config),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        executor,
        next_id,
        Arc::clone(&config),
    ));

    let recovered = incomplete.len();
    for job in incomplete {
        orchestrator.resume(job).await;
    }

    Ok(Runtime {
        orchestrator,
        event_tx,
        recovered,
        writer,
    })
}

// ---------------------------------------------------------------------------
// Daemon entry point
// ---------------------------------------------------------------------------

/// Run the daemon in the foreground until a shutdown signal arrives.
///
/// Order: config, data dirs, PID file, recovery, HTTP listener, signals,
/// then shutdown (cancel fetches, flush the store, release the PID file).
pub async fn start_daemon(
    config_path: Option<&Path>,
    data_dir_override: Option<&Path>,
    host_override: Option<&str>,
    port_override: Option<u16>,
) -> Result<()> {
    let mut config = load_config(config_path)?;

    if let Some(h) = host_override {
        config.host = h.to_string();
    }
    if let Some(p) = port_override {
        config.port = p;
    }

    let data_dir = match (data_dir_override, &config.data_dir) {
        (Some(d), _) => d.to_path_buf(),
        (None, Some(d)) => d.clone(),
        (None, None) => resolve_data_dir(None),
    };
    config.data_dir = Some(data_dir.clone());
    let config = Arc::new(config);

    create_data_dirs(&data_dir).await?;

    let pid_file = PidFile::new(data_dir.join(PID_FILE));
    pid_file.acquire()?;

    let result = serve(Arc::clone(&config), &data_dir).await;

    if let Err(e) = pid_file.release() {
        tracing::error!("Failed to release PID file: {}", e);
    }

    if result.is_ok() {
        tracing::info!("Daemon exited cleanly.");
    }
    result
}

async fn serve(config: Arc<DaemonConfig>, data_dir: &Path) -> Result<()> {
    let fetcher = Arc::new(HttpFetcher::new(&config)?) as Arc<dyn Fetcher>;
    let runtime = bootstrap(Arc::clone(&config), data_dir, fetcher).await?;
    if runtime.recovered > 0 {
        tracing::info!("Resumed {} incomplete job(s)", runtime.recovered);
    }

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(());

    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&runtime.orchestrator),
        event_tx: runtime.event_tx.clone(),
        config: Arc::clone(&config),
        start_time: Instant::now(),
        shutdown_tx: Some(shutdown_tx.clone()),
    });

    let router = server::create_router(state);
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            runtime.shutdown().await;
            return Err(e).context(format!("Failed to bind to {}", bind_addr));
        }
    };

    tracing::info!("Daemon started. Listening on http://{}", bind_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
                tracing::info!("HTTP server received shutdown signal");
            })
            .await
            .ok();
    });

    let mut api_shutdown_rx = shutdown_tx.subscribe();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
            }
            _ = api_shutdown_rx.changed() => {
                tracing::info!("Received API shutdown signal");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal");
            }
            _ = api_shutdown_rx.changed() => {
                tracing::info!("Received API shutdown signal");
            }
        }
    }

    let _ = shutdown_tx.send(());
    runtime.shutdown().await;
    let _ = server_handle.await;
    Ok(())
}
