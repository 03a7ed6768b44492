use gatehouse::config::Config;
use gatehouse::gate::AccessGate;
use gatehouse::proxy::ProxyServer;
use gatehouse::setup::{PKG_NAME, VERSION};
use gatehouse::supervisor::Supervisor;
use gatehouse::token::AccessToken;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gatehouse=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gatehouse.toml"));

    let config = Config::load_with_env(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let token = AccessToken::load_or_create(
        &config.gateway.state_dir(),
        config.gateway.token.as_deref(),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Supervisor::new(
        config.gateway.clone(),
        config.readiness.clone(),
        token.clone(),
    );
    let gate = AccessGate::new(config.server.ui_base_path.clone(), token);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(
        bind_addr,
        Arc::clone(&supervisor),
        gate,
        config.websocket.clone(),
        shutdown_rx.clone(),
    );

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    if supervisor.is_configured() {
        let warm = Arc::clone(&supervisor);
        tokio::spawn(async move {
            info!("Gateway configured, starting in background");
            if let Err(e) = warm.ensure_running().await {
                warn!(error = %e, "Background gateway start failed, will retry on demand");
            }
        });
    } else {
        info!(config_file = %config.gateway.config_file().display(), "Gateway not configured yet, serving landing page");
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP restarts the gateway
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup())
            .expect("Failed to install SIGHUP handler");

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
                    info!("Received SIGHUP, restarting gateway...");
                    let sup = Arc::clone(&supervisor);
                    tokio::spawn(async move {
                        match sup.restart().await {
                            Ok(()) => info!(pid = sup.status().pid, "Gateway restarted"),
                            Err(e) => error!(error = %e, "Gateway restart failed"),
                        }
                    });
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping gateway...");
    supervisor.shutdown().await;

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway wrapper");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        ui_base_path = %config.server.ui_base_path,
        "Server configuration"
    );
    info!(
        command = %config.gateway.command,
        args = ?config.gateway.args,
        port = config.gateway.port,
        state_dir = %config.gateway.state_dir,
        config_file = %config.gateway.config_file().display(),
        "Gateway settings"
    );
    info!(
        timeout_ms = config.readiness.timeout_ms,
        poll_interval_ms = config.readiness.poll_interval_ms,
        request_timeout_ms = config.readiness.request_timeout_ms,
        path = %config.readiness.path,
        "Readiness settings"
    );
    info!(
        keepalive_ms = config.websocket.keepalive_ms,
        ping_interval_ms = config.websocket.ping_interval_ms,
        close_timeout_ms = config.websocket.close_timeout_ms,
        "WebSocket settings"
    );
}
