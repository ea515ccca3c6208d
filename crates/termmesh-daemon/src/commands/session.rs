//! `termmesh session {list,create,close,remove,restart}` — thin CLI wrappers
//! around the daemon's IPC surface. Grounded on `happy-cli::commands::run`'s
//! pattern of formatting whatever the daemon/server returns for the
//! terminal, simplified to this daemon's JSON request/response shape.

use anyhow::Result;
use termmesh_core::settings::SettingsManager;
use termmesh_core::types::{Session, SessionKind};

use super::ipc_client::IpcClient;
use crate::daemon::ipc::IpcRequest;

fn client() -> Result<IpcClient> {
    let settings = SettingsManager::load().unwrap_or_default();
    Ok(IpcClient::new(settings.ipc_port))
}

fn request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub async fn list() -> Result<()> {
    let value = client()?.call(IpcRequest::List { request_id: request_id() }).await?;
    let sessions: Vec<Session> = serde_json::from_value(value)?;
    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  {:<10}  {:?}  {}",
            session.id, session.name, session.status, session.metadata.working_dir
        );
    }
    Ok(())
}

pub async fn create(kind: SessionKind, dir: String, name: Option<String>) -> Result<()> {
    let value = client()?
        .call(IpcRequest::Create { request_id: request_id(), kind, dir, name })
        .await?;
    let session: Session = serde_json::from_value(value)?;
    println!("created {} ({})", session.id, session.name);
    Ok(())
}

pub async fn close(id: String) -> Result<()> {
    client()?.call(IpcRequest::Close { request_id: request_id(), id: id.clone() }).await?;
    println!("closed {id}");
    Ok(())
}

pub async fn remove(id: String) -> Result<()> {
    client()?.call(IpcRequest::Remove { request_id: request_id(), id: id.clone() }).await?;
    println!("removed {id}");
    Ok(())
}

pub async fn restart(id: String) -> Result<()> {
    let value = client()?.call(IpcRequest::Restart { request_id: request_id(), id }).await?;
    let session: Session = serde_json::from_value(value)?;
    println!("restarted {} ({})", session.id, session.name);
    Ok(())
}
