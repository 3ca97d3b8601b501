//! polyglot — a multiplexing broker between one stdio tool client and a
//! pool of language servers.
//!
//! Startup: load configuration, spawn and initialize a session per
//! configured language, then serve the tool protocol on stdin/stdout.
//! Shutdown runs on client EOF, SIGINT/SIGTERM, or parent-process death,
//! and closes every session in order. Exit code 0 on a clean shutdown,
//! 1 when startup fails.

mod config;
mod rpc;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use polyglot_lsp::Router;

/// Stdout carries the upstream protocol, so logs go to stderr only.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .with(env_filter)
        .init();
}

fn config_path_from_args() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    return PathBuf::from(path);
                }
            }
            other => {
                if let Some(path) = other.strip_prefix("--config=") {
                    return PathBuf::from(path);
                }
            }
        }
    }
    PathBuf::from("polyglot.json")
}

/// Resolves when the parent process goes away. Upstream clients do not
/// reliably kill their children, so the broker watches its parent and
/// shuts down with it.
#[cfg(unix)]
async fn parent_death() {
    let initial = unsafe { libc::getppid() };
    tracing::debug!(ppid = initial, "monitoring parent process");
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;
        let current = unsafe { libc::getppid() };
        if current != initial && (current == 1 || initial == 1) {
            tracing::info!(
                ppid = initial,
                current,
                "parent process terminated, shutting down"
            );
            return;
        }
    }
}

#[cfg(not(unix))]
async fn parent_death() {
    std::future::pending::<()>().await
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::warn!("cannot install SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}

async fn run() -> Result<()> {
    let config_path = config_path_from_args();
    let config = config::load(&config_path)?;

    let router = Router::start(&config.workspace_dir, &config.language_servers)
        .await
        .context("starting language servers")?;

    // Per-language watcher registrations are preserved: every session
    // reports to the same hook, and the external watcher decides what to
    // do with them.
    for session in router.sessions() {
        let language = session.language().to_string();
        session.set_file_watch_callback(move |id, watchers| {
            tracing::info!(
                language = %language,
                registration = %id,
                watchers = watchers.len(),
                "file watch registration received"
            );
        });
    }

    tokio::select! {
        served = rpc::serve(&router) => {
            served.context("serving upstream client")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
        _ = terminate_signal() => {
            tracing::info!("termination signal received, shutting down");
        }
        _ = parent_death() => {}
    }

    router.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(e) = run().await {
        tracing::error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
