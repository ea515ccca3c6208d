//! Thin IPC client used by the `session`/`peer`/`daemon status` subcommands
//! to talk to an already-running daemon. Grounded on
//! `happy-cli::daemon::DaemonClient::send_rpc`/`attach_session` (connect,
//! send one request, wait for the matching reply), generalized from the
//! teacher's one-shot TCP request/response to a single request/response over
//! the same WebSocket the daemon's IPC surface otherwise uses for events.

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::daemon::ipc::{IpcRequest, IpcResponse};

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub struct IpcClient {
    port: u16,
}

impl IpcClient {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Sends `request` and returns the parsed `value` of the matching
    /// `IpcResponse::Result`, mapping an `ok: false` reply to an `Err`.
    pub async fn call(&self, request: IpcRequest) -> Result<serde_json::Value> {
        let url = format!("ws://127.0.0.1:{}", self.port);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .context("failed to connect to daemon IPC port; is the daemon running?")?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(serde_json::to_string(&request)?)).await?;

        let reply = tokio::time::timeout(REQUEST_TIMEOUT, async {
            while let Some(msg) = stream.next().await {
                match msg? {
                    Message::Text(text) => {
                        if let Ok(IpcResponse::Result { ok, value, error, .. }) =
                            serde_json::from_str::<IpcResponse>(&text)
                        {
                            if ok {
                                return Ok(value.unwrap_or(serde_json::Value::Null));
                            }
                            bail!(error.unwrap_or_else(|| "daemon returned an error".to_string()));
                        }
                        // An IpcEvent, not our reply; keep waiting.
                    }
                    Message::Close(_) => bail!("daemon closed the connection"),
                    _ => continue,
                }
            }
            bail!("daemon closed the connection before replying")
        })
        .await
        .context("timed out waiting for daemon reply")??;

        Ok(reply)
    }
}
