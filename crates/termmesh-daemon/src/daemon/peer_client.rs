//! Peer client (§4.10): one connection out to a remote instance. Grounded
//! on `happy-cli::daemon::bridge::RemoteRelayBridge::run`'s reconnect loop
//! (`backoff = min(backoff*2, 30)`) and `DaemonClient::attach_session`'s
//! `tokio_tungstenite::connect_async` + split usage.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use termmesh_core::types::{Session, SessionKind};
use termmesh_crypto::dh::generate_keypair;
use termmesh_crypto::SessionCrypto;

use super::wire::{EncryptedEnvelope, HandshakeFrame, SecureFrame};

const RPC_TIMEOUT: Duration = Duration::from_secs(15);
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Reconnected,
    Output { session_id: String, data: String },
    Update { session: Session },
    Exit { session_id: String, code: Option<i32> },
    Disconnected,
}

struct Pending {
    reply_tx: oneshot::Sender<SecureFrame>,
}

struct Shared {
    pending: Mutex<HashMap<String, Pending>>,
    outbound: mpsc::Sender<SecureFrame>,
    should_reconnect: std::sync::atomic::AtomicBool,
}

pub struct PeerClient {
    shared: Arc<Shared>,
}

impl PeerClient {
    /// Performs the first connection attempt synchronously, and on success
    /// spawns the long-lived task that runs the read/write pump and, on an
    /// abnormal close, the exponential-backoff reconnect loop (§4.10).
    /// Returns once `auth:approved` is reached or the first attempt fails.
    pub async fn connect(
        address: String,
        port: u16,
        local_identity_hash: String,
        local_hostname: String,
        local_instance_id: String,
    ) -> anyhow::Result<(Self, mpsc::Receiver<ClientEvent>)> {
        let (outbound_tx, outbound_rx) = mpsc::channel::<SecureFrame>(256);
        let (events_tx, events_rx) = mpsc::channel::<ClientEvent>(256);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            should_reconnect: std::sync::atomic::AtomicBool::new(true),
        });

        let attempt = Attempt {
            address,
            port,
            local_identity_hash,
            local_hostname,
            local_instance_id,
        };

        match connect_and_authenticate(&attempt).await {
            Ok(Some((sink, stream, crypto))) => {
                let _ = events_tx.send(ClientEvent::Connected).await;
                tokio::spawn(pump_then_reconnect(
                    attempt,
                    shared.clone(),
                    events_tx,
                    outbound_rx,
                    sink,
                    stream,
                    crypto,
                ));
                Ok((Self { shared }, events_rx))
            }
            Ok(None) | Err(_) => anyhow::bail!("connection closed before auth:approved"),
        }
    }

    async fn request(&self, build: impl FnOnce(String) -> SecureFrame) -> anyhow::Result<SecureFrame> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(request_id.clone(), Pending { reply_tx });
        self.shared.outbound.send(build(request_id.clone())).await?;

        match tokio::time::timeout(RPC_TIMEOUT, reply_rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => anyhow::bail!("connection closed"),
            Err(_) => {
                self.shared.pending.lock().await.remove(&request_id);
                anyhow::bail!("request {request_id} timed out")
            }
        }
    }

    pub async fn list_sessions(&self) -> anyhow::Result<Vec<Session>> {
        match self.request(|request_id| SecureFrame::SessionList { request_id }).await? {
            SecureFrame::SessionListResponse { sessions, .. } => Ok(sessions),
            other => anyhow::bail!("unexpected reply to session:list: {other:?}"),
        }
    }

    pub async fn create_session(
        &self,
        kind: SessionKind,
        working_dir: String,
        name: Option<String>,
    ) -> anyhow::Result<Session> {
        match self
            .request(|request_id| SecureFrame::SessionCreate {
                request_id,
                kind,
                working_dir,
                name,
            })
            .await?
        {
            SecureFrame::SessionCreateResponse { session: Some(session), .. } => Ok(session),
            SecureFrame::SessionCreateResponse { error: Some(error), .. } => anyhow::bail!(error),
            other => anyhow::bail!("unexpected reply to session:create: {other:?}"),
        }
    }

    pub async fn close_session(&self, session_id: String) -> anyhow::Result<()> {
        match self
            .request(|request_id| SecureFrame::SessionClose { request_id, session_id })
            .await?
        {
            SecureFrame::SessionCloseResponse { error: None, .. } => Ok(()),
            SecureFrame::SessionCloseResponse { error: Some(error), .. } => anyhow::bail!(error),
            other => anyhow::bail!("unexpected reply to session:close: {other:?}"),
        }
    }

    pub async fn write(&self, session_id: String, data: String) {
        let _ = self.shared.outbound.send(SecureFrame::SessionWrite { session_id, data }).await;
    }

    pub async fn resize(&self, session_id: String, cols: u16, rows: u16) {
        let _ = self
            .shared
            .outbound
            .send(SecureFrame::SessionResize { session_id, cols, rows })
            .await;
    }

    /// Disables future reconnect attempts; the current connection, if any,
    /// keeps running until it naturally closes.
    pub fn disable_reconnect(&self) {
        self.shared.should_reconnect.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

struct Attempt {
    address: String,
    port: u16,
    local_identity_hash: String,
    local_hostname: String,
    local_instance_id: String,
}

/// Connects and runs the plaintext key exchange plus the `auth:request` /
/// `auth:approved` handshake. Returns `Ok(None)` when the peer denies auth or
/// closes the socket before approving — in that case `should_reconnect` is
/// cleared, since retrying a denial is pointless.
async fn connect_and_authenticate(
    attempt: &Attempt,
) -> anyhow::Result<Option<(WsSink, WsSource, SessionCrypto)>> {
    let url = format!("ws://{}:{}", attempt.address, attempt.port);
    let (ws, _) = tokio_tungstenite::connect_async(&url).await?;
    let (mut sink, mut stream) = ws.split();

    let keypair = generate_keypair();
    let Some(Ok(Message::Text(text))) = stream.next().await else {
        return Ok(None);
    };
    let HandshakeFrame::KeyExchange { public_key: remote_public } = serde_json::from_str(&text)?;
    let own_handshake = HandshakeFrame::KeyExchange { public_key: keypair.public_base64() };
    sink.send(Message::Text(serde_json::to_string(&own_handshake)?)).await?;

    let crypto = SessionCrypto::derive(&keypair, &remote_public)?;

    let auth = SecureFrame::AuthRequest {
        identity_hash: attempt.local_identity_hash.clone(),
        hostname: attempt.local_hostname.clone(),
        instance_id: attempt.local_instance_id.clone(),
    };
    send_secure(&mut sink, &crypto, &auth).await?;

    loop {
        match recv_secure(&mut stream, &crypto).await? {
            Some(SecureFrame::AuthApproved) => return Ok(Some((sink, stream, crypto))),
            Some(SecureFrame::AuthDenied { .. }) | None => return Ok(None),
            Some(_) => continue,
        }
    }
}

/// Runs the read/write pump for one authenticated connection until the
/// socket closes, draining any still-pending RPCs into a disconnect reply.
/// Read and write share one `tokio::select!` loop, per the reconnect-loop
/// grounding in `bridge::RemoteRelayBridge::run`.
async fn pump(
    mut sink: WsSink,
    mut stream: WsSource,
    crypto: SessionCrypto,
    shared: &Arc<Shared>,
    events_tx: &mpsc::Sender<ClientEvent>,
    outbound_rx: &mut mpsc::Receiver<SecureFrame>,
) {
    loop {
        tokio::select! {
            incoming = recv_secure(&mut stream, &crypto) => {
                match incoming {
                    Ok(Some(frame)) => dispatch_incoming(frame, shared, events_tx).await,
                    Ok(None) | Err(_) => break,
                }
            }
            Some(frame) = outbound_rx.recv() => {
                if send_secure(&mut sink, &crypto, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = events_tx.send(ClientEvent::Disconnected).await;
    for (_, pending) in shared.pending.lock().await.drain() {
        let _ = pending.reply_tx.send(SecureFrame::Disconnect);
    }
}

/// Runs the first authenticated connection's pump, then hands off to the
/// reconnect loop once it drops.
async fn pump_then_reconnect(
    attempt: Attempt,
    shared: Arc<Shared>,
    events_tx: mpsc::Sender<ClientEvent>,
    mut outbound_rx: mpsc::Receiver<SecureFrame>,
    sink: WsSink,
    stream: WsSource,
    crypto: SessionCrypto,
) {
    pump(sink, stream, crypto, &shared, &events_tx, &mut outbound_rx).await;
    reconnect_loop(attempt, shared, events_tx, outbound_rx).await;
}

async fn dispatch_incoming(frame: SecureFrame, shared: &Arc<Shared>, events_tx: &mpsc::Sender<ClientEvent>) {
    if let Some(request_id) = frame.request_id() {
        if let Some(pending) = shared.pending.lock().await.remove(request_id) {
            let _ = pending.reply_tx.send(frame);
            return;
        }
    }
    match frame {
        SecureFrame::SessionOutput { session_id, data } => {
            let _ = events_tx.send(ClientEvent::Output { session_id, data }).await;
        }
        SecureFrame::SessionUpdate { session } => {
            let _ = events_tx.send(ClientEvent::Update { session }).await;
        }
        SecureFrame::SessionExit { session_id, code } => {
            let _ = events_tx.send(ClientEvent::Exit { session_id, code }).await;
        }
        SecureFrame::Disconnect => {
            let _ = events_tx.send(ClientEvent::Disconnected).await;
        }
        _ => {}
    }
}

/// Reconnects with backoff 1s→30s cap after the initial connection drops,
/// per §4.10. Exits once `should_reconnect` is cleared (auth denial or an
/// explicit `disconnect(instanceId)` from the peer manager).
async fn reconnect_loop(
    attempt: Attempt,
    shared: Arc<Shared>,
    events_tx: mpsc::Sender<ClientEvent>,
    mut outbound_rx: mpsc::Receiver<SecureFrame>,
) {
    let mut backoff = RECONNECT_INITIAL;
    loop {
        if !shared.should_reconnect.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(backoff).await;
        if !shared.should_reconnect.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        match connect_and_authenticate(&attempt).await {
            Ok(Some((sink, stream, crypto))) => {
                let _ = events_tx.send(ClientEvent::Reconnected).await;
                backoff = RECONNECT_INITIAL;
                pump(sink, stream, crypto, &shared, &events_tx, &mut outbound_rx).await;
            }
            Ok(None) => return,
            Err(_) => backoff = std::cmp::min(backoff * 2, RECONNECT_CAP),
        }
    }
}

async fn recv_secure(
    stream: &mut (impl futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    crypto: &SessionCrypto,
) -> anyhow::Result<Option<SecureFrame>> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let envelope: EncryptedEnvelope = serde_json::from_str(&text)?;
                let plaintext = crypto.decrypt(&envelope.sealed)?;
                return Ok(Some(serde_json::from_slice(&plaintext)?));
            }
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn send_secure(
    sink: &mut (impl futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    crypto: &SessionCrypto,
    frame: &SecureFrame,
) -> anyhow::Result<()> {
    let sealed = crypto.encrypt(&serde_json::to_vec(frame)?)?;
    let envelope = EncryptedEnvelope { sealed };
    sink.send(Message::Text(serde_json::to_string(&envelope)?)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let mut backoff = RECONNECT_INITIAL;
        let mut sequence = vec![backoff];
        for _ in 0..8 {
            backoff = std::cmp::min(backoff * 2, RECONNECT_CAP);
            sequence.push(backoff);
        }
        assert_eq!(*sequence.last().unwrap(), RECONNECT_CAP);
        assert!(sequence.windows(2).all(|w| w[1] >= w[0]));
    }
}
