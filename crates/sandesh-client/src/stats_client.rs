//! UDP side-channel mirroring UVE traffic to an external stats daemon.
//!
//! Strictly best-effort: connect failures and send failures are logged and
//! the next send retries the connection.

use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use sandesh_transport::codec;

use crate::message::SandeshMessage;

/// Fire-and-forget mirror of UVE messages over UDP.
pub struct StatsClient {
    target: String,
    socket: Mutex<Option<UdpSocket>>,
}

impl std::fmt::Debug for StatsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsClient")
            .field("target", &self.target)
            .finish()
    }
}

impl StatsClient {
    /// Creates a disconnected client for `target` (`host:port`).
    pub fn new(target: String) -> Self {
        Self {
            target,
            socket: Mutex::new(None),
        }
    }

    /// Mirrors one message. Failures only log; the connection is retried on
    /// the next send.
    pub async fn send(&self, msg: &SandeshMessage) {
        let record = serde_json::json!({
            "name": msg.name,
            "seqnum": msg.seqnum,
            "data": msg.payload,
        });
        let buf = match codec::encode_record(&record) {
            Ok(buf) => buf,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode stats record");
                return;
            }
        };

        let mut socket = self.socket.lock().await;
        if socket.is_none() {
            match self.connect().await {
                Ok(connected) => *socket = Some(connected),
                Err(err) => {
                    tracing::error!(target = %self.target, error = %err, "error connecting to stats server");
                    return;
                }
            }
        }
        if let Some(connected) = socket.as_ref() {
            if let Err(err) = connected.send(&buf).await {
                tracing::error!(target = %self.target, error = %err, "error sending data to stats server");
                *socket = None;
            }
        }
    }

    async fn connect(&self) -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.target).await?;
        Ok(socket)
    }
}
