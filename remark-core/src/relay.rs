//! Cross-process status relay
//!
//! Lets the delivery outcome (a daily count) and the resolved identity
//! reach any interested process, best effort, no acknowledgments. Inside a
//! process the relay is a broadcast channel; across processes it is a Unix
//! socket speaking one JSON message per line. Every inbound frame is
//! re-broadcast to all subscribers; there is no ordering guarantee across
//! message kinds, and consumers simply overwrite state with the latest
//! value they see.

use crate::error::{Error, Result};
use crate::types::ActorIdentity;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixListener, UnixStream,
};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Relay message kinds.
///
/// Unknown `type` discriminators are ignored by [`decode_frame`], not
/// treated as errors, so peers running newer versions stay compatible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Ask the aggregator for the actor's admitted-comment count that day
    RequestCount {
        actor_key: String,
        date: String,
        timezone: String,
    },
    /// Broadcast the latest known count; repeated values are harmless
    CountUpdated { count: i64 },
    /// A presentation process asking for the resolved identity
    RequestIdentity,
    /// Reply carrying the currently resolved identity (may be empty)
    IdentityReply { identity: ActorIdentity },
}

/// Decode one relay frame; malformed frames and unknown types are `None`.
pub fn decode_frame(line: &str) -> Option<Message> {
    serde_json::from_str(line.trim()).ok()
}

/// Encode one relay frame (newline-terminated).
pub fn encode_frame(msg: &Message) -> Result<String> {
    let mut frame = serde_json::to_string(msg)?;
    frame.push('\n');
    Ok(frame)
}

/// In-process fan-out hub, optionally served over a Unix socket.
#[derive(Clone)]
pub struct RelayHub {
    tx: broadcast::Sender<Message>,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Publish to all current subscribers. Best effort: no subscribers is
    /// not an error.
    pub fn publish(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    /// Serve the hub on a Unix socket until shutdown. Each connected peer
    /// gets every published message and may inject messages of its own.
    pub async fn serve(
        &self,
        socket_path: &Path,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Stale socket from a previous run
        let _ = std::fs::remove_file(socket_path);

        let listener = UnixListener::bind(socket_path)
            .map_err(|e| Error::Relay(format!("cannot bind {:?}: {}", socket_path, e)))?;
        tracing::info!(path = %socket_path.display(), "Relay listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let hub = self.clone();
                        tokio::spawn(async move { hub.serve_peer(stream).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Relay accept failed");
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        let _ = std::fs::remove_file(socket_path);
        Ok(())
    }

    async fn serve_peer(&self, stream: UnixStream) {
        let peer_id = Uuid::new_v4();
        tracing::debug!(peer = %peer_id, "Relay peer connected");

        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut rx = self.subscribe();

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(msg) = decode_frame(&line) {
                            self.publish(msg);
                        }
                    }
                    Ok(None) | Err(_) => break,
                },
                msg = rx.recv() => match msg {
                    Ok(msg) => {
                        let Ok(frame) = encode_frame(&msg) else { continue };
                        if write.write_all(frame.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(peer = %peer_id, skipped, "Relay peer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        tracing::debug!(peer = %peer_id, "Relay peer disconnected");
    }
}

/// Client end of the relay, for processes that do not host the hub.
pub struct RelayPeer {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl RelayPeer {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| Error::Relay(format!("cannot connect {:?}: {}", socket_path, e)))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.write
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| Error::Relay(format!("relay send failed: {}", e)))
    }

    /// Next decodable message, skipping frames this peer does not
    /// understand. `None` on hub shutdown.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            match self
                .lines
                .next_line()
                .await
                .map_err(|e| Error::Relay(format!("relay recv failed: {}", e)))?
            {
                Some(line) => {
                    if let Some(msg) = decode_frame(&line) {
                        return Ok(Some(msg));
                    }
                }
                None => return Ok(None),
            }
        }
    }
}
