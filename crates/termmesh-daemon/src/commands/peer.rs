//! `termmesh peer {status,list,connect,disconnect}` — CLI wrappers around
//! the peer fabric surface exposed over IPC. Grounded the same way as
//! `commands::session` on the teacher's thin-wrapper-over-daemon-RPC style.

use anyhow::Result;
use termmesh_core::settings::SettingsManager;
use termmesh_core::types::PeerHostDescriptor;

use super::ipc_client::IpcClient;
use crate::daemon::ipc::IpcRequest;
use crate::daemon::peer_manager::PeerFabricStatus;

fn client() -> Result<IpcClient> {
    let settings = SettingsManager::load().unwrap_or_default();
    Ok(IpcClient::new(settings.ipc_port))
}

fn request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub async fn status() -> Result<()> {
    let value = client()?.call(IpcRequest::TunnelGetStatus { request_id: request_id() }).await?;
    let status: PeerFabricStatus = serde_json::from_value(value)?;
    if !status.enabled {
        println!("peer fabric disabled (no git user.email configured)");
        return Ok(());
    }
    let identity = status.identity.expect("enabled implies identity present");
    println!("peer fabric enabled");
    println!("   instance id: {}", identity.instance_id);
    println!("   hostname:    {}", identity.hostname);
    println!("   identity:    {}", identity.identity_hash);
    Ok(())
}

pub async fn list() -> Result<()> {
    let value = client()?.call(IpcRequest::GetDiscoveredHosts { request_id: request_id() }).await?;
    let hosts: Vec<PeerHostDescriptor> = serde_json::from_value(value)?;
    if hosts.is_empty() {
        println!("no peers discovered");
        return Ok(());
    }
    for host in hosts {
        println!(
            "{}  {}  {}:{}  {:?}",
            host.instance_id, host.hostname, host.address, host.port, host.status
        );
    }
    Ok(())
}

pub async fn connect(instance_id: String) -> Result<()> {
    client()?
        .call(IpcRequest::Connect { request_id: request_id(), instance_id: instance_id.clone() })
        .await?;
    println!("connected to {instance_id}");
    Ok(())
}

pub async fn disconnect(instance_id: String) -> Result<()> {
    client()?
        .call(IpcRequest::Disconnect { request_id: request_id(), instance_id: instance_id.clone() })
        .await?;
    println!("disconnected from {instance_id}");
    Ok(())
}
