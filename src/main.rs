use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use evs_core::config::{self, ConfigStore, ServiceSettings};
use evs_core::ipc::IPCServer;
use evs_core::process_monitor::{ProcessTree, SystemProcessTree};
use evs_core::supervisor::{Supervisor, SupervisorOptions};
use evs_core::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = config::config_path();

    // 서브커맨드는 설정 파일만 수정하고 종료
    if cli::handle(&args, &config_path)? {
        return Ok(());
    }

    tracing::info!("evs service starting (config: {})", config_path.display());

    let store = Arc::new(ConfigStore::new(&config_path));
    if let Err(e) = store.force_reload() {
        tracing::warn!("Configuration not loaded: {}", e);
    }
    let settings: ServiceSettings = store
        .snapshot()
        .map(|r| r.settings())
        .unwrap_or_default()
        .with_env_overrides();

    let tree: Arc<dyn ProcessTree> = Arc::new(SystemProcessTree::new());
    let supervisor = Supervisor::new(store, tree, SupervisorOptions::from(&settings), args);
    let shutdown = supervisor.shutdown_token();

    let server = IPCServer::new(supervisor.clone(), &settings.listen_addr, settings.read_timeout());
    let listener = match server.bind().await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Cannot listen on {}: {}", settings.listen_addr, e);
            return Err(e);
        }
    };

    if let Err(e) = supervisor.bootstrap().await {
        tracing::error!("Startup launch failed [{}]: {}", e.error_code(), e);
    }

    // Graceful shutdown: Ctrl+C / SIGTERM 시 소유한 프로세스 트리 정리
    let sup_signal = supervisor.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received, cleaning up...");
        sup_signal.kill_owned_tree_now().await;
        sup_signal.shutdown_token().cancel();
    });

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                tracing::error!("Control server error: {}", e);
            }
        }
        _ = shutdown.cancelled() => {}
    }

    tracing::info!("evs service shutting down");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
