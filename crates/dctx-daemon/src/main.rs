//! dctx-daemon — the broker daemon: Session & Context Store, Meta-Broker,
//! and the §6.2 command surface, served over the §6.1 HTTP route.

use anyhow::{Context, Result};
use dctx_core::config::Config;
use dctx_core::lockfile::DaemonLockfile;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    dctx_telemetry::logging::init_logging("dctx-daemon", "info");

    info!(pid = std::process::id(), version = env!("CARGO_PKG_VERSION"), "dctx-daemon starting");

    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });

    // --- Startup guard: check if a daemon is already running ---
    let replace_mode = std::env::args().any(|a| a == "--replace" || a == "-r");
    if let Some(existing) = DaemonLockfile::read_valid() {
        if replace_mode {
            info!(pid = existing.pid, "replacing existing daemon (--replace)");
            #[cfg(unix)]
            unsafe {
                libc::kill(existing.pid as i32, libc::SIGTERM);
            }
            // Give old daemon a moment to clean up, then force-remove stale lockfile.
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            DaemonLockfile::remove();
        } else {
            eprintln!(
                "dctx-daemon already running (pid={}, api={})\n\nHint: use --replace to restart it.",
                existing.pid,
                existing.api_url(),
            );
            std::process::exit(1);
        }
    }

    let bind_addr = format!("{}:{}", config.daemon.host, config.daemon.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {bind_addr}"))?;
    let api_port = listener.local_addr()?.port();
    info!(api_port, "API listener bound");

    let lockfile = DaemonLockfile {
        pid: std::process::id(),
        api_port,
        host: config.daemon.host.clone(),
        started_at: chrono::Utc::now().to_rfc3339(),
        project_path: std::env::current_dir().ok().map(|p| p.to_string_lossy().into_owned()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Err(msg) = lockfile.acquire_or_fail() {
        eprintln!("failed to acquire lockfile: {msg}");
        std::process::exit(1);
    }
    info!(path = %DaemonLockfile::path().display(), "lockfile written");

    let daemon = dctx_daemon::daemon::Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown + remove the lockfile.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        DaemonLockfile::remove();
        shutdown.trigger();
    });

    info!("API server: http://{bind_addr}");

    if let Err(e) = daemon.run_with_listener(listener).await {
        tracing::error!(error = %e, "daemon execution failed");
        DaemonLockfile::remove();
        return Err(e);
    }

    DaemonLockfile::remove();
    info!("dctx-daemon stopped");
    Ok(())
}
