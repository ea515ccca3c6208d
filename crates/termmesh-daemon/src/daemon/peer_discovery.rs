//! Peer discovery (§4.8): mDNS publish/browse plus a UDP broadcast beacon,
//! with staleness sweeping. Nothing in the teacher repo does LAN discovery
//! — `mdns-sd` and `if-addrs` are brought in from the pack's general
//! preference for a small focused crate over hand-rolled socket code (the
//! same posture the teacher takes with `portable-pty`/`sysinfo`/`nix`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Duration, Instant};

use termmesh_core::types::{PeerHostDescriptor, PeerStatus};

pub const SERVICE_TYPE: &str = "_terminal-manager._udp.local.";
pub const BEACON_PORT: u16 = 41832;
const BEACON_INTERVAL: Duration = Duration::from_secs(5);
const HOST_STALE_AFTER: Duration = Duration::from_secs(20);
const BEACON_MAGIC: &str = "TM_BEACON_V1";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BeaconPayload {
    magic: String,
    instance_id: String,
    hostname: String,
    identity_hash: String,
    port: u16,
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    HostFound(PeerHostDescriptor),
    HostLost(String),
}

struct HostEntry {
    descriptor: PeerHostDescriptor,
    last_seen: Instant,
}

pub struct PeerDiscovery {
    local_instance_id: String,
    local_identity_hash: String,
    local_hostname: String,
    peer_port: u16,
    hosts: Arc<RwLock<HashMap<String, HostEntry>>>,
    events_tx: mpsc::Sender<DiscoveryEvent>,
}

impl PeerDiscovery {
    pub fn new(
        local_instance_id: String,
        local_identity_hash: String,
        local_hostname: String,
        peer_port: u16,
    ) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        (
            Self {
                local_instance_id,
                local_identity_hash,
                local_hostname,
                peer_port,
                hosts: Arc::new(RwLock::new(HashMap::new())),
                events_tx,
            },
            events_rx,
        )
    }

    pub async fn discovered_hosts(&self) -> Vec<PeerHostDescriptor> {
        self.hosts.read().await.values().map(|e| e.descriptor.clone()).collect()
    }

    /// Reverse discovery (§4.8): the peer server registers a descriptor for
    /// a remote it just authenticated, independent of mDNS/broadcast.
    pub async fn register_from_connection(&self, descriptor: PeerHostDescriptor) {
        let mut hosts = self.hosts.write().await;
        let entry = hosts.entry(descriptor.instance_id.clone()).or_insert_with(|| HostEntry {
            descriptor: descriptor.clone(),
            last_seen: Instant::now(),
        });
        entry.descriptor = descriptor;
        entry.last_seen = Instant::now();
    }

    pub async fn mark_status(&self, instance_id: &str, status: PeerStatus) {
        if let Some(entry) = self.hosts.write().await.get_mut(instance_id) {
            entry.descriptor.status = status;
        }
    }

    /// Publishes this instance via mDNS and spawns the receive/sweep tasks.
    /// Returns immediately; everything runs on spawned tasks.
    pub fn start(self: Arc<Self>) {
        self.clone().spawn_mdns();
        self.clone().spawn_udp_beacon();
        self.spawn_sweeper();
    }

    fn spawn_mdns(self: Arc<Self>) {
        tokio::task::spawn_blocking(move || {
            let daemon = match mdns_sd::ServiceDaemon::new() {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "mDNS daemon unavailable, continuing without it");
                    return;
                }
            };
            let address = routable_ipv4().map(|a| a.to_string());
            let mut properties = HashMap::new();
            properties.insert("instanceId".to_string(), self.local_instance_id.clone());
            properties.insert("hostname".to_string(), self.local_hostname.clone());
            properties.insert("identityHash".to_string(), self.local_identity_hash.clone());

            let host_ipv4 = address.clone().unwrap_or_else(|| "0.0.0.0".to_string());
            let instance_name = format!("{}-{}", self.local_hostname, self.local_instance_id);
            match mdns_sd::ServiceInfo::new(
                SERVICE_TYPE,
                &instance_name,
                &format!("{instance_name}.local."),
                host_ipv4.as_str(),
                self.peer_port,
                properties,
            ) {
                Ok(info) => {
                    if let Err(e) = daemon.register(info) {
                        tracing::warn!(error = %e, "failed to register mDNS service");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to build mDNS service info"),
            }

            let Ok(receiver) = daemon.browse(SERVICE_TYPE) else {
                tracing::warn!("failed to browse mDNS service type");
                return;
            };
            while let Ok(event) = receiver.recv() {
                if let mdns_sd::ServiceEvent::ServiceResolved(info) = event {
                    let props = info.get_properties();
                    let instance_id = props
                        .get_property_val_str("instanceId")
                        .unwrap_or_default()
                        .to_string();
                    let identity_hash = props
                        .get_property_val_str("identityHash")
                        .unwrap_or_default()
                        .to_string();
                    let hostname = props
                        .get_property_val_str("hostname")
                        .unwrap_or_default()
                        .to_string();
                    let addr = info.get_addresses().iter().next().copied();
                    if let Some(addr) = addr {
                        let descriptor = PeerHostDescriptor {
                            instance_id,
                            hostname,
                            identity_hash,
                            address: addr.to_string(),
                            port: info.get_port(),
                            status: PeerStatus::Discovered,
                        };
                        let this = self.clone();
                        tokio::runtime::Handle::try_current().ok().map(|h| {
                            h.spawn(async move { this.admit(descriptor).await });
                        });
                    }
                }
            }
        });
    }

    fn spawn_udp_beacon(self: Arc<Self>) {
        tokio::spawn(async move {
            let socket = match UdpSocket::bind(("0.0.0.0", BEACON_PORT)).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to bind beacon socket, beacon disabled");
                    return;
                }
            };
            if let Err(e) = socket.set_broadcast(true) {
                tracing::warn!(error = %e, "SO_BROADCAST unavailable, beacon disabled");
                return;
            }
            let socket = Arc::new(socket);
            let sender = socket.clone();
            let this = self.clone();
            tokio::spawn(async move { this.beacon_send_loop(sender).await });

            let mut buf = [0u8; 2048];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => self.handle_beacon(&buf[..n], from).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "beacon recv error");
                        break;
                    }
                }
            }
        });
    }

    async fn beacon_send_loop(&self, socket: Arc<UdpSocket>) {
        let payload = BeaconPayload {
            magic: BEACON_MAGIC.to_string(),
            instance_id: self.local_instance_id.clone(),
            hostname: self.local_hostname.clone(),
            identity_hash: self.local_identity_hash.clone(),
            port: self.peer_port,
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(_) => return,
        };
        let mut interval = tokio::time::interval(BEACON_INTERVAL);
        loop {
            interval.tick().await;
            let mut targets: Vec<SocketAddr> =
                vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), BEACON_PORT)];
            for iface in if_addrs::get_if_addrs().unwrap_or_default() {
                if let if_addrs::IfAddr::V4(v4) = iface.addr {
                    if let Some(broadcast) = v4.broadcast {
                        targets.push(SocketAddr::new(IpAddr::V4(broadcast), BEACON_PORT));
                    }
                }
            }
            for target in targets {
                if let Err(e) = socket.send_to(&body, target).await {
                    tracing::warn!(error = %e, %target, "beacon send failed");
                }
            }
        }
    }

    async fn handle_beacon(&self, bytes: &[u8], from: SocketAddr) {
        let Ok(payload) = serde_json::from_slice::<BeaconPayload>(bytes) else {
            return;
        };
        if payload.magic != BEACON_MAGIC {
            return;
        }
        if payload.instance_id == self.local_instance_id {
            return;
        }
        if payload.identity_hash != self.local_identity_hash {
            return;
        }
        let descriptor = PeerHostDescriptor {
            instance_id: payload.instance_id,
            hostname: payload.hostname,
            identity_hash: payload.identity_hash,
            address: from.ip().to_string(),
            port: payload.port,
            status: PeerStatus::Discovered,
        };
        self.admit(descriptor).await;
    }

    /// Admits a discovered host, never overwriting a `connecting`/
    /// `connected` entry per §4.8.
    async fn admit(&self, descriptor: PeerHostDescriptor) {
        let mut hosts = self.hosts.write().await;
        let is_new = !hosts.contains_key(&descriptor.instance_id);
        let entry = hosts
            .entry(descriptor.instance_id.clone())
            .or_insert_with(|| HostEntry {
                descriptor: descriptor.clone(),
                last_seen: Instant::now(),
            });
        entry.last_seen = Instant::now();
        if !matches!(entry.descriptor.status, PeerStatus::Connecting | PeerStatus::Connected) {
            entry.descriptor = descriptor.clone();
        }
        drop(hosts);
        if is_new {
            let _ = self.events_tx.send(DiscoveryEvent::HostFound(descriptor)).await;
        }
    }

    fn spawn_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let mut stale = Vec::new();
                {
                    let hosts = self.hosts.read().await;
                    for (id, entry) in hosts.iter() {
                        if matches!(entry.descriptor.status, PeerStatus::Connecting | PeerStatus::Connected) {
                            continue;
                        }
                        if entry.last_seen.elapsed() > HOST_STALE_AFTER {
                            stale.push(id.clone());
                        }
                    }
                }
                for id in stale {
                    self.hosts.write().await.remove(&id);
                    let _ = self.events_tx.send(DiscoveryEvent::HostLost(id)).await;
                }
            }
        });
    }
}

/// Prefers a routable IPv4 address (not loopback, not link-local) for the
/// mDNS service address, per §4.8.
fn routable_ipv4() -> Option<Ipv4Addr> {
    if_addrs::get_if_addrs().ok()?.into_iter().find_map(|iface| match iface.addr {
        if_addrs::IfAddr::V4(v4) if !v4.ip.is_loopback() && !is_link_local(&v4.ip) => Some(v4.ip),
        _ => None,
    })
}

fn is_link_local(ip: &Ipv4Addr) -> bool {
    ip.octets()[0] == 169 && ip.octets()[1] == 254
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admit_ignores_foreign_identity_hash() {
        let (discovery, _rx) = PeerDiscovery::new(
            "local-id".into(),
            "localhash".into(),
            "local-host".into(),
            9500,
        );
        // handle_beacon is the gate that checks identity hash before ever
        // reaching admit(); exercise it directly.
        let payload = BeaconPayload {
            magic: BEACON_MAGIC.to_string(),
            instance_id: "remote-id".into(),
            hostname: "remote-host".into(),
            identity_hash: "differenthash".into(),
            port: 9500,
        };
        discovery
            .handle_beacon(
                &serde_json::to_vec(&payload).unwrap(),
                SocketAddr::from(([127, 0, 0, 1], 41832)),
            )
            .await;
        assert!(discovery.discovered_hosts().await.is_empty());
    }

    #[tokio::test]
    async fn admit_accepts_matching_identity_hash() {
        let (discovery, _rx) = PeerDiscovery::new(
            "local-id".into(),
            "samehash".into(),
            "local-host".into(),
            9500,
        );
        let payload = BeaconPayload {
            magic: BEACON_MAGIC.to_string(),
            instance_id: "remote-id".into(),
            hostname: "remote-host".into(),
            identity_hash: "samehash".into(),
            port: 9500,
        };
        discovery
            .handle_beacon(
                &serde_json::to_vec(&payload).unwrap(),
                SocketAddr::from(([127, 0, 0, 1], 41832)),
            )
            .await;
        let hosts = discovery.discovered_hosts().await;
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].instance_id, "remote-id");
    }

    #[tokio::test]
    async fn connecting_status_is_not_overwritten_by_rediscovery() {
        let (discovery, _rx) = PeerDiscovery::new(
            "local-id".into(),
            "samehash".into(),
            "local-host".into(),
            9500,
        );
        discovery
            .admit(PeerHostDescriptor {
                instance_id: "remote-id".into(),
                hostname: "remote-host".into(),
                identity_hash: "samehash".into(),
                address: "10.0.0.5".into(),
                port: 9500,
                status: PeerStatus::Discovered,
            })
            .await;
        discovery.mark_status("remote-id", PeerStatus::Connecting).await;
        discovery
            .admit(PeerHostDescriptor {
                instance_id: "remote-id".into(),
                hostname: "remote-host".into(),
                identity_hash: "samehash".into(),
                address: "10.0.0.5".into(),
                port: 9500,
                status: PeerStatus::Discovered,
            })
            .await;
        let hosts = discovery.discovered_hosts().await;
        assert_eq!(hosts[0].status, PeerStatus::Connecting);
    }
}
