//! Peer manager (§4.11): owns identity, discovery, the server, and the map
//! of connected clients. Grounded on `DaemonSessionManager`'s ownership of a
//! `relays: HashMap<String, RelayHandle>`, generalized to
//! `clients: HashMap<instance_id, PeerClientHandle>`, and on the
//! "supervisor never knows about the manager" dependency direction.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use termmesh_core::identity::{self, IdentityResolution};
use termmesh_core::types::{LocalIdentity, PeerHostDescriptor, PeerStatus, Session, SessionKind};

use super::peer_client::{ClientEvent, PeerClient};
use super::peer_discovery::{DiscoveryEvent, PeerDiscovery};
use super::peer_server::{LocalIdentitySummary, PeerServer};
use super::supervisor::Supervisor;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PeerFabricStatus {
    pub enabled: bool,
    pub identity: Option<LocalIdentity>,
}

/// Events the IPC layer subscribes to in order to forward remote-peer
/// activity to the frontend under the `tunnel:<instance>:<id>` prefix (§6).
#[derive(Debug, Clone)]
pub enum PeerFabricEvent {
    HostFound(PeerHostDescriptor),
    HostLost(String),
    Connected(String),
    Output { instance_id: String, session_id: String, data: String },
    Update { instance_id: String, session: Session },
    Exit { instance_id: String, session_id: String, code: Option<i32> },
    Disconnected(String),
}

const EVENTS_CAPACITY: usize = 1024;

struct ClientHandle {
    client: PeerClient,
}

pub struct PeerManager {
    identity: Option<LocalIdentity>,
    discovery: Option<Arc<PeerDiscovery>>,
    server: Option<Arc<PeerServer>>,
    clients: Arc<RwLock<HashMap<String, ClientHandle>>>,
    events_tx: broadcast::Sender<PeerFabricEvent>,
}

impl PeerManager {
    /// Resolves identity and, if enabled, wires discovery + server against
    /// the supervisor. Returns a manager that reports `enabled: false` and
    /// refuses every remote operation when identity resolution fails — the
    /// peer fabric as a whole is optional per §4.3.
    pub async fn start(supervisor: Arc<Supervisor>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);

        let identity = match identity::resolve() {
            IdentityResolution::Enabled(identity) => identity,
            IdentityResolution::Disabled => {
                tracing::info!("peer fabric disabled: no git user.email configured");
                return Self {
                    identity: None,
                    discovery: None,
                    server: None,
                    clients: Arc::new(RwLock::new(HashMap::new())),
                    events_tx,
                };
            }
        };

        let (listener, port) = match PeerServer::bind().await {
            Ok(bound) => bound,
            Err(e) => {
                tracing::warn!(error = %e, "failed to bind peer server, peer fabric disabled");
                return Self {
                    identity: Some(identity),
                    discovery: None,
                    server: None,
                    clients: Arc::new(RwLock::new(HashMap::new())),
                    events_tx,
                };
            }
        };
        tracing::info!(port, "peer server listening");

        let (discovery, mut discovery_events) = PeerDiscovery::new(
            identity.instance_id.clone(),
            identity.identity_hash.clone(),
            identity.hostname.clone(),
            port,
        );
        let discovery = Arc::new(discovery);

        let server = Arc::new(PeerServer::new(
            supervisor,
            discovery.clone(),
            LocalIdentitySummary {
                identity_hash: identity.identity_hash.clone(),
                hostname: identity.hostname.clone(),
                instance_id: identity.instance_id.clone(),
            },
        ));
        server.clone().run(listener);
        discovery.clone().start();

        let discovery_events_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = discovery_events.recv().await {
                match event {
                    DiscoveryEvent::HostFound(host) => {
                        tracing::debug!(instance_id = %host.instance_id, "peer discovered");
                        let _ = discovery_events_tx.send(PeerFabricEvent::HostFound(host));
                    }
                    DiscoveryEvent::HostLost(id) => {
                        tracing::debug!(instance_id = %id, "peer lost");
                        let _ = discovery_events_tx.send(PeerFabricEvent::HostLost(id));
                    }
                }
            }
        });

        Self {
            identity: Some(identity),
            discovery: Some(discovery),
            server: Some(server),
            clients: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
        }
    }

    pub fn status(&self) -> PeerFabricStatus {
        PeerFabricStatus {
            enabled: self.identity.is_some(),
            identity: self.identity.clone(),
        }
    }

    /// Subscribes to remote-peer activity (host discovery plus connected
    /// clients' session events) for the IPC layer to forward to the
    /// frontend under the `tunnel:<instance>:<id>` prefix.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerFabricEvent> {
        self.events_tx.subscribe()
    }

    pub async fn discovered_hosts(&self) -> Vec<PeerHostDescriptor> {
        match &self.discovery {
            Some(d) => d.discovered_hosts().await,
            None => Vec::new(),
        }
    }

    pub async fn connected_hosts(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    pub async fn connect(&self, instance_id: &str) -> anyhow::Result<()> {
        let discovery = self
            .discovery
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("peer fabric not enabled"))?;
        let identity = self.identity.as_ref().expect("discovery implies identity");

        let host = discovery
            .discovered_hosts()
            .await
            .into_iter()
            .find(|h| h.instance_id == instance_id)
            .ok_or_else(|| anyhow::anyhow!("unknown peer {instance_id}"))?;

        discovery.mark_status(instance_id, PeerStatus::Connecting).await;

        match PeerClient::connect(
            host.address.clone(),
            host.port,
            identity.identity_hash.clone(),
            identity.hostname.clone(),
            identity.instance_id.clone(),
        )
        .await
        {
            Ok((client, mut events)) => {
                discovery.mark_status(instance_id, PeerStatus::Connected).await;
                self.clients.write().await.insert(instance_id.to_string(), ClientHandle { client });

                let discovery = discovery.clone();
                let clients = self.clients.clone();
                let fabric_events = self.events_tx.clone();
                let instance_id = instance_id.to_string();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        let mapped = match event {
                            ClientEvent::Connected | ClientEvent::Reconnected => {
                                Some(PeerFabricEvent::Connected(instance_id.clone()))
                            }
                            ClientEvent::Output { session_id, data } => Some(PeerFabricEvent::Output {
                                instance_id: instance_id.clone(),
                                session_id,
                                data,
                            }),
                            ClientEvent::Update { session } => {
                                Some(PeerFabricEvent::Update { instance_id: instance_id.clone(), session })
                            }
                            ClientEvent::Exit { session_id, code } => Some(PeerFabricEvent::Exit {
                                instance_id: instance_id.clone(),
                                session_id,
                                code,
                            }),
                            ClientEvent::Disconnected => {
                                clients.write().await.remove(&instance_id);
                                discovery.mark_status(&instance_id, PeerStatus::Discovered).await;
                                Some(PeerFabricEvent::Disconnected(instance_id.clone()))
                            }
                        };
                        if let Some(mapped) = mapped {
                            let _ = fabric_events.send(mapped);
                        }
                    }
                });
                Ok(())
            }
            Err(e) => {
                discovery.mark_status(instance_id, PeerStatus::Discovered).await;
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self, instance_id: &str) {
        if let Some(handle) = self.clients.write().await.remove(instance_id) {
            handle.client.disable_reconnect();
        }
        if let Some(discovery) = &self.discovery {
            discovery.mark_status(instance_id, PeerStatus::Disconnected).await;
        }
    }

    async fn client_for(&self, instance_id: &str) -> anyhow::Result<()> {
        if self.clients.read().await.contains_key(instance_id) {
            Ok(())
        } else {
            anyhow::bail!("not connected to {instance_id}")
        }
    }

    pub async fn list_remote_sessions(&self, instance_id: &str) -> anyhow::Result<Vec<Session>> {
        self.client_for(instance_id).await?;
        let clients = self.clients.read().await;
        clients.get(instance_id).unwrap().client.list_sessions().await
    }

    pub async fn create_remote_session(
        &self,
        instance_id: &str,
        kind: SessionKind,
        working_dir: String,
        name: Option<String>,
    ) -> anyhow::Result<Session> {
        self.client_for(instance_id).await?;
        let clients = self.clients.read().await;
        clients
            .get(instance_id)
            .unwrap()
            .client
            .create_session(kind, working_dir, name)
            .await
    }

    pub async fn close_remote_session(&self, instance_id: &str, session_id: String) -> anyhow::Result<()> {
        self.client_for(instance_id).await?;
        let clients = self.clients.read().await;
        clients.get(instance_id).unwrap().client.close_session(session_id).await
    }

    pub async fn write_remote_session(&self, instance_id: &str, session_id: String, data: String) {
        if let Some(handle) = self.clients.read().await.get(instance_id) {
            handle.client.write(session_id, data).await;
        }
    }

    pub async fn resize_remote_session(&self, instance_id: &str, session_id: String, cols: u16, rows: u16) {
        if let Some(handle) = self.clients.read().await.get(instance_id) {
            handle.client.resize(session_id, cols, rows).await;
        }
    }

    pub async fn shutdown(&self) {
        if let Some(server) = &self.server {
            server.shutdown().await;
        }
        for (_, handle) in self.clients.write().await.drain() {
            handle.client.disable_reconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_manager() -> PeerManager {
        let (events_tx, _) = broadcast::channel(16);
        PeerManager {
            identity: None,
            discovery: None,
            server: None,
            clients: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
        }
    }

    #[tokio::test]
    async fn unconnected_peer_operations_return_not_connected_error() {
        let manager = empty_manager();
        assert!(manager.list_remote_sessions("nope").await.is_err());
        assert!(manager.connect("nope").await.is_err());
    }

    #[test]
    fn status_reports_disabled_without_identity() {
        let manager = empty_manager();
        assert!(!manager.status().enabled);
    }
}
