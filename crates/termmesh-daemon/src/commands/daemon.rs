//! Daemon lifecycle commands: start/stop/status/run. Grounded on
//! `happy-cli::daemon::DaemonManager` (pid file presence + `kill(pid, 0)`
//! liveness check, detached child spawn, `daemon run`'s own file-logging
//! setup).

use anyhow::{Context, Result};
use std::process::Stdio;
use termmesh_core::settings::SettingsManager;
use tokio::process::Command;

pub struct DaemonManager;

impl DaemonManager {
    pub fn new() -> Self {
        Self
    }

    pub async fn is_running(&self) -> bool {
        let Ok(pid_path) = termmesh_core::paths::pid_path() else {
            return false;
        };
        let Ok(pid_str) = tokio::fs::read_to_string(&pid_path).await else {
            return false;
        };
        let Ok(pid) = pid_str.trim().parse::<i32>() else {
            return false;
        };
        #[cfg(unix)]
        {
            unsafe { libc::kill(pid, 0) == 0 }
        }
        #[cfg(windows)]
        {
            use sysinfo::{ProcessExt, System, SystemExt};
            let s = System::new_all();
            s.process(sysinfo::Pid::from(pid as usize)).is_some()
        }
    }

    pub async fn start(&self) -> Result<()> {
        let home = termmesh_core::paths::termmesh_home()?;
        let pid_path = termmesh_core::paths::pid_path()?;
        tokio::fs::create_dir_all(&home).await?;

        let current_exe = std::env::current_exe()?;
        let mut cmd = Command::new(current_exe);
        cmd.arg("daemon")
            .arg("run")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .current_dir(&home)
            .env("TERMMESH_DAEMON", "1");

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let child = cmd.spawn().context("failed to spawn daemon process")?;
        let pid = child.id().context("failed to get daemon pid")?;
        tokio::fs::write(&pid_path, pid.to_string()).await?;

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let pid_path = termmesh_core::paths::pid_path()?;
        if let Ok(pid_str) = tokio::fs::read_to_string(&pid_path).await {
            if let Ok(pid) = pid_str.trim().parse::<i32>() {
                #[cfg(unix)]
                {
                    unsafe {
                        libc::kill(pid, libc::SIGTERM);
                    }
                }
                #[cfg(windows)]
                {
                    use sysinfo::{ProcessExt, System, SystemExt};
                    let mut s = System::new_all();
                    s.refresh_all();
                    if let Some(process) = s.process(sysinfo::Pid::from(pid as usize)) {
                        process.kill();
                    }
                }
            }
        }
        let _ = tokio::fs::remove_file(&pid_path).await;
        Ok(())
    }
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn start() -> Result<()> {
    let manager = DaemonManager::new();
    if manager.is_running().await {
        println!("daemon is already running");
        return Ok(());
    }
    manager.start().await.context("failed to start daemon")?;
    println!("daemon started");
    Ok(())
}

pub async fn stop() -> Result<()> {
    let manager = DaemonManager::new();
    if !manager.is_running().await {
        println!("daemon is not running");
        return Ok(());
    }
    manager.stop().await.context("failed to stop daemon")?;
    println!("daemon stopped");
    Ok(())
}

pub async fn restart() -> Result<()> {
    let manager = DaemonManager::new();
    if manager.is_running().await {
        manager.stop().await?;
    }
    manager.start().await.context("failed to restart daemon")?;
    println!("daemon restarted");
    Ok(())
}

pub async fn status() -> Result<()> {
    let manager = DaemonManager::new();
    if !manager.is_running().await {
        println!("daemon is not running");
        return Ok(());
    }
    println!("daemon is running");
    let settings = SettingsManager::load().unwrap_or_default();
    let client = super::ipc_client::IpcClient::new(settings.ipc_port);
    let request = crate::daemon::ipc::IpcRequest::List { request_id: uuid::Uuid::new_v4().to_string() };
    match client.call(request).await {
        Ok(serde_json::Value::Array(sessions)) => {
            println!("   sessions: {}", sessions.len());
        }
        Ok(_) | Err(_) => {
            println!("   (unable to reach daemon IPC surface)");
        }
    }
    Ok(())
}

/// Foreground entry point: `termmesh daemon run`. Sets up file logging (no
/// terminal is attached once double-forked by [`start`]) and runs the
/// daemon until ctrl-c or a SIGTERM.
pub async fn run() -> Result<()> {
    let log_dir = termmesh_core::paths::log_path().unwrap_or_else(|_| std::path::PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);

    let file_appender = tracing_appender::rolling::daily(&log_dir, "termmesh.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("termmesh daemon starting");

    let shutdown = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    };

    crate::daemon::run(shutdown).await
}
