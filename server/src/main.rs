//! Standalone TerminalSync server binary. Run with --config, --host, --port,
//! --web-root; environment variables override file settings.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use common::config::Config;
use common::store::SessionStore;
use server::manager::{SessionManager, IDLE_GRACE};
use server::web_server::{self, AppState};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config_path: Option<PathBuf> = None;
    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut web_root: Option<PathBuf> = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            config_path = Some(PathBuf::from(&args[i + 1]));
            i += 2;
            continue;
        }
        if args[i] == "--host" && i + 1 < args.len() {
            host = Some(args[i + 1].clone());
            i += 2;
            continue;
        }
        if args[i] == "--port" && i + 1 < args.len() {
            port = args[i + 1].parse().ok();
            i += 2;
            continue;
        }
        if args[i] == "--web-root" && i + 1 < args.len() {
            web_root = Some(PathBuf::from(&args[i + 1]));
            i += 2;
            continue;
        }
        i += 1;
    }

    let mut config = Config::load(config_path.as_deref());
    if let Some(h) = host {
        config.host = h;
    }
    if let Some(p) = port {
        config.port = p;
    }
    if let Some(w) = web_root {
        config.web_root = w;
    }

    let Some(token) = config.token.clone() else {
        return Err(
            "no auth token configured; set TERMINALSYNC_TOKEN or `token` in settings.json".into(),
        );
    };
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let store = SessionStore::new();
        let manager = SessionManager::new(
            store,
            config.max_clients,
            IDLE_GRACE,
            Arc::new(|| std::process::exit(0)),
        );
        manager.spawn_store_listener();

        let state = Arc::new(AppState {
            manager: manager.clone(),
            token,
            web_root: config.web_root.clone(),
            default_shell: config.default_shell.clone(),
            scrollback_lines: config.scrollback_lines,
        });

        let pid_path = write_pid_file();
        let result = tokio::select! {
            r = web_server::run_web_server(addr, state) => r,
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                manager.shutdown().await;
                Ok(())
            }
        };
        if let Some(path) = pid_path {
            let _ = std::fs::remove_file(path);
        }
        result
    })
}

fn write_pid_file() -> Option<PathBuf> {
    let path = std::env::temp_dir().join("terminalsync.pid");
    match std::fs::write(&path, std::process::id().to_string()) {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!(error = %e, "could not write pid file");
            None
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
