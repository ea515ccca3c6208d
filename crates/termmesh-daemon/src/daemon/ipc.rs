//! IPC surface (§6): a local-loopback JSON-over-WebSocket protocol the
//! frontend speaks to the daemon. Grounded directly on
//! `happy-cli::daemon::server::{ClientMessage, ServerMessage, DaemonServer}`
//! — same request/response-by-tag enum shape and per-connection state
//! struct, generalized to the full session+peer surface spec.md §6 names.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use termmesh_core::paths::expand_home;
use termmesh_core::types::{
    is_tunnel_id, make_tunnel_id, parse_tunnel_id, PeerHostDescriptor, Session, SessionKind,
};

use super::peer_manager::{PeerFabricEvent, PeerFabricStatus, PeerManager};
use super::supervisor::{CreateRequest, Supervisor, SupervisorEvent};
use super::watcher::DiscoveredSession;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IpcRequest {
    Create { request_id: String, kind: SessionKind, dir: String, name: Option<String> },
    Close { request_id: String, id: String },
    Remove { request_id: String, id: String },
    Restart { request_id: String, id: String },
    List { request_id: String },
    Get { request_id: String, id: String },
    Write { id: String, data: String },
    Resize { id: String, cols: u16, rows: u16 },
    GetImportable { request_id: String },
    Import { request_id: String, project: String, name: Option<String> },
    LoadFromFile { request_id: String, path: String },
    OpenFolderDialog { request_id: String },
    OpenSessionsFileDialog { request_id: String },

    TunnelGetStatus { request_id: String },
    GetDiscoveredHosts { request_id: String },
    GetConnectedHosts { request_id: String },
    Connect { request_id: String, instance_id: String },
    Disconnect { request_id: String, instance_id: String },
    ListRemoteSessions { request_id: String, instance_id: String },
    CreateRemoteSession {
        request_id: String,
        instance_id: String,
        kind: SessionKind,
        dir: String,
        name: Option<String>,
    },
    CloseRemoteSession { request_id: String, instance_id: String, session_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IpcResponse {
    Result { request_id: String, ok: bool, value: Option<serde_json::Value>, error: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IpcEvent {
    #[serde(rename = "session:output")]
    SessionOutput { id: String, data: String },
    #[serde(rename = "session:update")]
    SessionUpdate { session: Session },
    #[serde(rename = "session:exit")]
    SessionExit { id: String, code: Option<i32> },
    #[serde(rename = "tunnel:host-found")]
    TunnelHostFound { host: PeerHostDescriptor },
    #[serde(rename = "tunnel:host-lost")]
    TunnelHostLost { instance_id: String },
    #[serde(rename = "tunnel:connected")]
    TunnelConnected { instance_id: String },
    #[serde(rename = "tunnel:disconnected")]
    TunnelDisconnected { instance_id: String },
}

#[derive(Debug, Deserialize)]
struct BulkLoadConfig {
    sessions: Vec<BulkLoadEntry>,
}

#[derive(Debug, Deserialize)]
struct BulkLoadEntry {
    #[serde(rename = "type")]
    kind: SessionKind,
    folder: String,
    name: Option<String>,
}

pub struct IpcServer {
    supervisor: Arc<Supervisor>,
    peer_manager: Arc<PeerManager>,
    importable: Arc<tokio::sync::RwLock<Vec<DiscoveredSession>>>,
}

const NOT_IMPLEMENTED: &str = "not implemented: no GUI shell present in this daemon";

impl IpcServer {
    pub fn new(
        supervisor: Arc<Supervisor>,
        peer_manager: Arc<PeerManager>,
        importable: Arc<tokio::sync::RwLock<Vec<DiscoveredSession>>>,
    ) -> Self {
        Self { supervisor, peer_manager, importable }
    }

    pub async fn bind(&self, port: u16) -> std::io::Result<TcpListener> {
        TcpListener::bind(("127.0.0.1", port)).await
    }

    pub fn run(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.handle_connection(stream).await {
                                tracing::debug!(%addr, error = %e, "ipc connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "ipc listener accept failed");
                        break;
                    }
                }
            }
        });
    }

    async fn handle_connection(&self, stream: tokio::net::TcpStream) -> anyhow::Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut stream) = ws.split();

        let mut supervisor_events = self.supervisor.subscribe();
        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<IpcEvent>(256);
        let forwarder = tokio::spawn({
            let event_tx = event_tx.clone();
            async move {
                while let Ok(event) = supervisor_events.recv().await {
                    let mapped = match event {
                        SupervisorEvent::Output { session_id, data } => IpcEvent::SessionOutput {
                            id: session_id,
                            data: String::from_utf8_lossy(&data).to_string(),
                        },
                        SupervisorEvent::Update { session } => IpcEvent::SessionUpdate { session },
                        SupervisorEvent::Exit { session_id, code } => {
                            IpcEvent::SessionExit { id: session_id, code }
                        }
                    };
                    if event_tx.send(mapped).await.is_err() {
                        break;
                    }
                }
            }
        });

        // Remote session events carry the id in its bare remote form; this
        // is the only site that wraps it as `tunnel:<instance>:<id>` before
        // handing it to the frontend (§4.11/§6).
        let mut peer_events = self.peer_manager.subscribe();
        let peer_forwarder = tokio::spawn(async move {
            loop {
                match peer_events.recv().await {
                    Ok(event) => {
                        let mapped = match event {
                            PeerFabricEvent::HostFound(host) => Some(IpcEvent::TunnelHostFound { host }),
                            PeerFabricEvent::HostLost(instance_id) => {
                                Some(IpcEvent::TunnelHostLost { instance_id })
                            }
                            PeerFabricEvent::Connected(instance_id) => {
                                Some(IpcEvent::TunnelConnected { instance_id })
                            }
                            PeerFabricEvent::Disconnected(instance_id) => {
                                Some(IpcEvent::TunnelDisconnected { instance_id })
                            }
                            PeerFabricEvent::Output { instance_id, session_id, data } => {
                                Some(IpcEvent::SessionOutput { id: make_tunnel_id(&instance_id, &session_id), data })
                            }
                            PeerFabricEvent::Update { instance_id, mut session } => {
                                session.id = make_tunnel_id(&instance_id, &session.id);
                                Some(IpcEvent::SessionUpdate { session })
                            }
                            PeerFabricEvent::Exit { instance_id, session_id, code } => {
                                Some(IpcEvent::SessionExit { id: make_tunnel_id(&instance_id, &session_id), code })
                            }
                        };
                        if let Some(mapped) = mapped {
                            if event_tx.send(mapped).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        loop {
            tokio::select! {
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<IpcRequest>(&text) {
                                Ok(request) => {
                                    if let Some(response) = self.handle_request(request).await {
                                        sink.send(Message::Text(serde_json::to_string(&response)?)).await?;
                                    }
                                }
                                Err(e) => tracing::debug!(error = %e, "unparseable ipc request"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                Some(event) = event_rx.recv() => {
                    sink.send(Message::Text(serde_json::to_string(&event)?)).await?;
                }
            }
        }

        forwarder.abort();
        peer_forwarder.abort();
        Ok(())
    }

    async fn handle_request(&self, request: IpcRequest) -> Option<IpcResponse> {
        Some(match request {
            IpcRequest::Create { request_id, kind, dir, name } => {
                respond(request_id, self.create_session(kind, dir, name, false, None).await)
            }
            IpcRequest::Close { request_id, id } => respond_unit(request_id, self.route_close(&id).await),
            IpcRequest::Remove { request_id, id } => {
                respond_unit(request_id, self.supervisor.remove(&id).await.map_err(anyhow::Error::from))
            }
            IpcRequest::Restart { request_id, id } => {
                respond(request_id, self.supervisor.restart(&id).await.map_err(anyhow::Error::from))
            }
            IpcRequest::List { request_id } => respond(request_id, Ok::<_, anyhow::Error>(self.supervisor.list().await)),
            IpcRequest::Get { request_id, id } => {
                respond(request_id, self.supervisor.get(&id).await.ok_or_else(|| anyhow::anyhow!("not found")))
            }
            IpcRequest::Write { id, data } => {
                self.route_write(&id, data).await;
                return None;
            }
            IpcRequest::Resize { id, cols, rows } => {
                self.route_resize(&id, cols, rows).await;
                return None;
            }
            IpcRequest::GetImportable { request_id } => {
                respond(request_id, Ok::<_, anyhow::Error>(self.importable.read().await.clone()))
            }
            IpcRequest::Import { request_id, project, name } => {
                let kind = self
                    .importable
                    .read()
                    .await
                    .iter()
                    .find(|d| d.working_dir.display().to_string() == project)
                    .map(|d| d.kind)
                    .unwrap_or(SessionKind::KindA);
                let working_dir = expand_home(&project);
                let result = self
                    .create_session(kind, working_dir.display().to_string(), name, false, None)
                    .await;
                if result.is_ok() {
                    self.importable.write().await.retain(|d| d.working_dir != working_dir);
                }
                respond(request_id, result)
            }
            IpcRequest::LoadFromFile { request_id, path } => respond(request_id, self.load_from_file(&path).await),
            IpcRequest::OpenFolderDialog { request_id } => {
                respond::<()>(request_id, Err(anyhow::anyhow!(NOT_IMPLEMENTED)))
            }
            IpcRequest::OpenSessionsFileDialog { request_id } => {
                respond::<()>(request_id, Err(anyhow::anyhow!(NOT_IMPLEMENTED)))
            }
            IpcRequest::TunnelGetStatus { request_id } => {
                respond(request_id, Ok::<_, anyhow::Error>(self.peer_manager.status()))
            }
            IpcRequest::GetDiscoveredHosts { request_id } => {
                respond(request_id, Ok::<_, anyhow::Error>(self.peer_manager.discovered_hosts().await))
            }
            IpcRequest::GetConnectedHosts { request_id } => {
                respond(request_id, Ok::<_, anyhow::Error>(self.peer_manager.connected_hosts().await))
            }
            IpcRequest::Connect { request_id, instance_id } => {
                respond_unit(request_id, self.peer_manager.connect(&instance_id).await)
            }
            IpcRequest::Disconnect { request_id, instance_id } => {
                self.peer_manager.disconnect(&instance_id).await;
                respond_unit(request_id, Ok(()))
            }
            IpcRequest::ListRemoteSessions { request_id, instance_id } => respond(
                request_id,
                self.peer_manager.list_remote_sessions(&instance_id).await,
            ),
            IpcRequest::CreateRemoteSession { request_id, instance_id, kind, dir, name } => respond(
                request_id,
                self.peer_manager.create_remote_session(&instance_id, kind, dir, name).await,
            ),
            IpcRequest::CloseRemoteSession { request_id, instance_id, session_id } => respond_unit(
                request_id,
                self.peer_manager.close_remote_session(&instance_id, session_id).await,
            ),
        })
    }

    async fn create_session(
        &self,
        kind: SessionKind,
        dir: String,
        name: Option<String>,
        resume: bool,
        id: Option<String>,
    ) -> anyhow::Result<Session> {
        self.supervisor
            .create(CreateRequest { kind, working_dir: PathBuf::from(dir), name, resume, id })
            .await
            .map_err(anyhow::Error::from)
    }

    /// Applies the tunnel id transform (§6): a `tunnel:<instance>:<id>`
    /// write/resize/close routes to the peer manager; a plain id routes to
    /// the local supervisor. This function and [`Self::route_write`]/
    /// [`Self::route_resize`] are the only places that reverse the prefix.
    async fn route_close(&self, id: &str) -> anyhow::Result<()> {
        if is_tunnel_id(id) {
            let (instance_id, remote_id) = parse_tunnel_id(id).ok_or_else(|| anyhow::anyhow!("malformed tunnel id"))?;
            self.peer_manager.close_remote_session(instance_id, remote_id.to_string()).await
        } else {
            self.supervisor.close(id).await.map_err(anyhow::Error::from)
        }
    }

    async fn route_write(&self, id: &str, data: String) {
        if is_tunnel_id(id) {
            if let Some((instance_id, remote_id)) = parse_tunnel_id(id) {
                self.peer_manager.write_remote_session(instance_id, remote_id.to_string(), data).await;
            }
        } else {
            let _ = self.supervisor.write(id, data.into_bytes()).await;
        }
    }

    async fn route_resize(&self, id: &str, cols: u16, rows: u16) {
        if is_tunnel_id(id) {
            if let Some((instance_id, remote_id)) = parse_tunnel_id(id) {
                self.peer_manager
                    .resize_remote_session(instance_id, remote_id.to_string(), cols, rows)
                    .await;
            }
        } else {
            let _ = self.supervisor.resize(id, cols, rows).await;
        }
    }

    async fn load_from_file(&self, path: &str) -> anyhow::Result<Vec<Session>> {
        let content = std::fs::read_to_string(expand_home(path))?;
        let config: BulkLoadConfig = serde_json::from_str(&content)?;
        let mut created = Vec::new();
        for entry in config.sessions {
            let working_dir = expand_home(&entry.folder);
            let session = self
                .create_session(entry.kind, working_dir.display().to_string(), entry.name, false, None)
                .await?;
            created.push(session);
        }
        Ok(created)
    }
}

fn respond<T: Serialize>(request_id: String, result: anyhow::Result<T>) -> IpcResponse {
    match result {
        Ok(value) => IpcResponse::Result {
            request_id,
            ok: true,
            value: serde_json::to_value(value).ok(),
            error: None,
        },
        Err(e) => IpcResponse::Result { request_id, ok: false, value: None, error: Some(e.to_string()) },
    }
}

fn respond_unit(request_id: String, result: anyhow::Result<()>) -> IpcResponse {
    respond(request_id, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_load_config_parses_type_tagged_entries() {
        let json = r#"{"sessions":[{"type":"kind-a","folder":"~/proj","name":"x"}]}"#;
        let parsed: BulkLoadConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.sessions.len(), 1);
        assert_eq!(parsed.sessions[0].folder, "~/proj");
    }

    #[test]
    fn request_tag_round_trips_through_json() {
        let req = IpcRequest::Write { id: "abc".into(), data: "hi".into() };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"op\":\"write\""));
        let back: IpcRequest = serde_json::from_str(&json).unwrap();
        matches!(back, IpcRequest::Write { .. });
    }

    #[test]
    fn not_implemented_error_surfaces_for_dialog_ops() {
        let resp = respond::<()>("1".into(), Err(anyhow::anyhow!(NOT_IMPLEMENTED)));
        match resp {
            IpcResponse::Result { ok, error, .. } => {
                assert!(!ok);
                assert_eq!(error.as_deref(), Some(NOT_IMPLEMENTED));
            }
        }
    }
}
