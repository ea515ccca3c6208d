//! Wires the supervisor, watcher, peer fabric and IPC surface together and
//! runs them until shutdown. Grounded on `happy-cli::daemon::mod`'s
//! composition root (`DaemonServer::run` assembling multiplexer + watcher +
//! relay bridge under one `tokio::select!`-driven lifetime).

pub mod ipc;
pub mod metadata;
pub mod peer_client;
pub mod peer_discovery;
pub mod peer_manager;
pub mod peer_server;
pub mod persistence;
pub mod pty_session;
pub mod supervisor;
pub mod watcher;
pub mod wire;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use termmesh_core::settings::{DaemonSettings, SettingsManager};

use peer_manager::PeerManager;
use supervisor::Supervisor;
use watcher::{Watcher, WatcherPaths};

const WATCHER_POLL_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(10);

/// Runs the foreground daemon until `shutdown_signal` resolves. This is what
/// `termmesh daemon run` and the double-forked child of `termmesh daemon
/// start` both execute.
pub async fn run(shutdown_signal: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
    let settings = SettingsManager::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load settings, using defaults");
        DaemonSettings::default()
    });

    let supervisor = Arc::new(Supervisor::new());
    supervisor.restore_sessions().await;

    let peer_manager = Arc::new(PeerManager::start(supervisor.clone()).await);

    let importable = Arc::new(RwLock::new(Vec::new()));
    let watcher_handle = spawn_watcher(supervisor.clone(), importable.clone());

    let ipc_server = Arc::new(ipc::IpcServer::new(supervisor.clone(), peer_manager.clone(), importable));
    let ipc_listener = ipc_server.bind(settings.ipc_port).await?;
    tracing::info!(port = settings.ipc_port, "ipc server listening");
    ipc_server.run(ipc_listener);

    shutdown_signal.await;
    tracing::info!("shutdown requested, closing sessions and peer connections");
    watcher_handle.abort();
    peer_manager.shutdown().await;
    supervisor.close_all().await;
    Ok(())
}

fn spawn_watcher(
    supervisor: Arc<Supervisor>,
    importable: Arc<RwLock<Vec<watcher::DiscoveredSession>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut watcher = Watcher::new(WatcherPaths::default());
        loop {
            let known: HashSet<PathBuf> = supervisor
                .list()
                .await
                .into_iter()
                .map(|s| PathBuf::from(s.metadata.working_dir))
                .collect();
            let discovered = watcher.poll(&known);
            if !discovered.is_empty() {
                let mut guard = importable.write().await;
                guard.extend(discovered);
            }
            tokio::time::sleep(WATCHER_POLL_INTERVAL).await;
        }
    })
}
