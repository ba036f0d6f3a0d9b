use mist::api::{ApiServer, ApiState};
use mist::auth::AuthManager;
use mist::config::{Config, ConfigWatcher, DataLayout, SharedConfig};
use mist::db::Database;
use mist::docker::{ContainerDriver, DockerDriver};
use mist::engine::Engine;
use mist::git::{GitSource, SourceProvider};
use mist::github::{GitHubClient, TokenCache};
use mist::intake::{self, Intake};
use mist::queue::Queue;
use mist::state::SetupState;
use mist::traefik;
use mist::webhooks::WebhookIngest;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mist=debug".parse().expect("valid log directive")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Startup::Config(e)) => {
            error!(error = %e, "Invalid configuration");
            ExitCode::from(2)
        }
        Err(Startup::Fatal(e)) => {
            error!(error = format!("{:#}", e), "Startup failed");
            ExitCode::FAILURE
        }
    }
}

enum Startup {
    Config(anyhow::Error),
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for Startup {
    fn from(e: anyhow::Error) -> Self {
        Startup::Fatal(e)
    }
}

async fn run() -> Result<(), Startup> {
    let layout = DataLayout::from_env();
    layout
        .ensure()
        .map_err(|e| anyhow::anyhow!("cannot create {}: {}", layout.root().display(), e))?;

    let config_path = layout.config_path();
    let config = Config::load(&config_path).map_err(Startup::Config)?;
    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&layout, &config);

    let _lock = lock_data_dir(&layout.root().join("mist.pid"))?;

    let db = Database::open(layout.database_path())?;
    info!(path = %layout.database_path().display(), "Database opened");

    let shared: SharedConfig = Arc::new(RwLock::new(config.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Collaborators
    let github = Arc::new(GitHubClient::new(
        db.clone(),
        Arc::clone(&shared),
        Arc::new(TokenCache::new()),
    )?);
    let source: Arc<dyn SourceProvider> = Arc::new(GitSource::new(github, layout.clone(), Arc::clone(&shared)));
    let driver: Arc<dyn ContainerDriver> = Arc::new(DockerDriver::connect(Arc::clone(&shared)).await?);
    if let Err(e) = driver.ensure_network(&config.docker.network).await {
        warn!(network = %config.docker.network, error = %e, "Could not ensure container network");
    }

    // Deployment core
    let engine = Arc::new(Engine::new(
        db.clone(),
        layout.clone(),
        Arc::clone(&shared),
        Arc::clone(&source),
        Arc::clone(&driver),
    ));
    let queue = Queue::start(engine, config.queue.capacity, config.queue.workers);

    let recovery = intake::recover(&db, &queue)?;
    if !recovery.requeued.is_empty() || !recovery.interrupted.is_empty() {
        info!(
            requeued = ?recovery.requeued,
            interrupted = ?recovery.interrupted,
            "Recovered deployments from previous run"
        );
    }

    let intake = Arc::new(Intake::new(db.clone(), Arc::clone(&queue), source));
    let webhooks = WebhookIngest::new(db.clone(), Arc::clone(&intake));

    if let Err(e) = traefik::sync_dashboard_route(&db, &layout, &config) {
        warn!(error = format!("{:#}", e), "Failed to write dashboard route");
    }

    // Config watcher; SIGHUP forces a reload
    let (watcher, mut reloaded_rx) = ConfigWatcher::new(&config_path, Arc::clone(&shared));
    let watcher = Arc::new(watcher);
    tokio::spawn(Arc::clone(&watcher).run(shutdown_rx.clone()));
    {
        let db = db.clone();
        let layout = layout.clone();
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while reloaded_rx.changed().await.is_ok() {
                let config = shared.read().clone();
                let layout = layout.clone();
                let synced = db
                    .call(move |db| traefik::sync_dashboard_route(db, &layout, &config))
                    .await;
                if let Err(e) = synced {
                    warn!(error = format!("{:#}", e), "Failed to resync dashboard route");
                }
            }
        });
    }

    // API
    let state = Arc::new(ApiState {
        auth: AuthManager::from_store(&db, &config)?,
        setup: SetupState::load(&db)?,
        db,
        config: Arc::clone(&shared),
        layout,
        intake,
        queue: Arc::clone(&queue),
        webhooks,
        driver,
    });
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| Startup::Config(anyhow::anyhow!("invalid bind address: {}", e)))?;
    let server = ApiServer::bind(state, addr).await?;
    let api_handle = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            error!(error = %e, "API server error");
        }
    });

    wait_for_shutdown(&watcher).await;

    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(shared.read().queue.shutdown_grace_secs);
    info!(grace_secs = grace.as_secs(), "Draining deployment queue...");
    queue.close(grace).await;

    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(watcher: &ConfigWatcher) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sighup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
        (Ok(term), Ok(hup)) => (term, hup),
        _ => {
            warn!("Could not install signal handlers, waiting for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration...");
                watcher.reload();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_watcher: &ConfigWatcher) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, shutting down...");
}

/// Lock file held for the life of the process
#[cfg(unix)]
struct DataLock {
    _file: std::fs::File,
}

/// Refuse to start when another process already owns the data directory
#[cfg(unix)]
fn lock_data_dir(path: &Path) -> anyhow::Result<DataLock> {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            anyhow::bail!("another instance already owns {}", path.display());
        }
        return Err(err.into());
    }

    file.set_len(0)?;
    writeln!(&file, "{}", std::process::id())?;
    Ok(DataLock { _file: file })
}

#[cfg(not(unix))]
struct DataLock;

#[cfg(not(unix))]
fn lock_data_dir(path: &Path) -> anyhow::Result<DataLock> {
    std::fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(DataLock)
}

fn print_startup_banner(layout: &DataLayout, config: &Config) {
    info!("========================================");
    info!("  {} v{}", PKG_NAME, VERSION);
    info!("========================================");
    info!("Data directory: {}", layout.root().display());
    info!("API: http://{}:{}", config.server.bind, config.server.port);
    info!(
        "Queue: capacity {}, {} worker(s)",
        config.queue.capacity, config.queue.workers
    );
    info!("Container network: {}", config.docker.network);
    if !config.network.wildcard_domain.is_empty() {
        info!("Wildcard domain: {}", config.network.wildcard_domain);
    }
    info!("========================================");
}
