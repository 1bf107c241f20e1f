//! Bridge server: authenticated duplex sessions with peer nodes.
//!
//! Nodes connect over TCP, present a `Hello`, and are either welcomed
//! (valid token, or freshly approved pairing) or handed a pairing code. At
//! most one session exists per node id; a newer attach displaces the older
//! one after a graceful `Goodbye`.

use crate::bridge::protocol::{
    read_frame, write_frame, BridgeFrame, FrameBody, NodeCapability, SeqTracker,
    HANDSHAKE_TIMEOUT, MAX_MISSED_PINGS, PING_INTERVAL,
};
use crate::config::BridgeConfig;
use crate::pairing::PairingStore;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Pairing-store provider namespace for bridge nodes.
const BRIDGE_PROVIDER: &str = "bridge";

/// Live attachment metadata.
#[derive(Debug, Clone)]
pub struct BridgeSessionInfo {
    pub node_id: String,
    pub display_name: String,
    pub platform: String,
    pub version: String,
    pub caps: Vec<NodeCapability>,
    pub commands: Vec<String>,
    pub attached_at_ms: i64,
    pub last_activity_ms: i64,
}

/// Node-originated admission forwarded into the gateway.
#[derive(Debug, Clone)]
pub struct BridgeInbound {
    pub node_id: String,
    pub name: String,
    pub payload: serde_json::Value,
}

struct NodeHandle {
    /// Distinguishes this attach from a displacing one for the same node.
    conn_id: u64,
    info: BridgeSessionInfo,
    tx: mpsc::UnboundedSender<FrameBody>,
    cancel: CancellationToken,
}

pub struct BridgeServer {
    config: BridgeConfig,
    pairing: Arc<PairingStore>,
    server_name: String,
    sessions: Arc<RwLock<HashMap<String, NodeHandle>>>,
    inbound: mpsc::UnboundedSender<BridgeInbound>,
    next_conn_id: AtomicU64,
}

impl BridgeServer {
    pub fn new(
        config: BridgeConfig,
        pairing: Arc<PairingStore>,
        server_name: impl Into<String>,
        inbound: mpsc::UnboundedSender<BridgeInbound>,
    ) -> Self {
        Self {
            config,
            pairing,
            server_name: server_name.into(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            inbound,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn sessions(&self) -> Vec<BridgeSessionInfo> {
        self.sessions
            .read()
            .values()
            .map(|h| h.info.clone())
            .collect()
    }

    /// Push an event frame to an attached node.
    pub fn send_event(&self, node_id: &str, name: &str, payload: serde_json::Value) -> Result<()> {
        let sessions = self.sessions.read();
        let handle = sessions
            .get(node_id)
            .with_context(|| format!("Node '{node_id}' is not attached"))?;
        handle
            .tx
            .send(FrameBody::Event {
                name: name.to_string(),
                payload,
            })
            .context("Node writer is gone")?;
        Ok(())
    }

    /// Bind the configured address and serve until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind bridge listener on {addr}"))?;
        tracing::info!("Bridge listening on {addr}");
        self.run_on(listener, cancel).await
    }

    /// Serve on an already-bound listener (tests bind port 0).
    pub async fn run_on(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted.context("Bridge accept failed")?,
            };
            tracing::debug!(%peer, "Bridge connection accepted");

            let server = self.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream, cancel).await {
                    tracing::debug!(%peer, "Bridge connection closed: {err:#}");
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut seq_in = SeqTracker::default();
        let mut seq_out = 0u64;

        // Handshake: Hello → Welcome (or Pair, then wait for a retried
        // Hello on the same connection), bounded by the handshake timeout.
        let hello = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            self.handshake(&mut reader, &mut writer, &mut seq_in, &mut seq_out),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Handshake timed out"))??;

        let Some(hello) = hello else {
            // Never authenticated; pairing code was surfaced.
            return Ok(());
        };
        let node_id = hello.node_id.clone();

        let (tx, rx) = mpsc::unbounded_channel::<FrameBody>();
        let conn_id = self.attach(&hello, tx.clone(), cancel.clone());

        // Writer task owns the write half and assigns outgoing seq.
        let write_cancel = cancel.clone();
        let writer_task = tokio::spawn(async move {
            let mut rx = rx;
            let mut seq = seq_out;
            loop {
                // Biased toward the queue so a final Goodbye drains before
                // the cancel tears the writer down.
                let body = tokio::select! {
                    biased;
                    body = rx.recv() => body,
                    () = write_cancel.cancelled() => break,
                };
                let Some(body) = body else { break };
                let goodbye = matches!(body, FrameBody::Goodbye { .. });
                seq += 1;
                if write_frame(&mut writer, &BridgeFrame { seq, body }).await.is_err() {
                    break;
                }
                if goodbye {
                    break;
                }
            }
        });

        // Ping task: send on the interval, close after two silent periods.
        let ping_tx = tx.clone();
        let ping_cancel = cancel.clone();
        let sessions = self.sessions.clone();
        let ping_node = node_id.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = ping_cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let now = now_ms();
                let last = sessions
                    .read()
                    .get(&ping_node)
                    .map(|h| h.info.last_activity_ms);
                let Some(last) = last else { return };
                let silent_for = now - last;
                if silent_for > PING_INTERVAL.as_millis() as i64 * i64::from(MAX_MISSED_PINGS) {
                    tracing::warn!(node = %ping_node, "Node missed pings; closing");
                    ping_cancel.cancel();
                    return;
                }
                let _ = ping_tx.send(FrameBody::Ping { ts: now });
            }
        });

        // Read loop.
        let result = self
            .read_loop(&node_id, &mut reader, &tx, &mut seq_in, &cancel)
            .await;

        cancel.cancel();
        let _ = writer_task.await;
        self.detach(&node_id, conn_id);
        result
    }

    /// Returns the accepted Hello, or None when the connection ended in the
    /// pairing state.
    async fn handshake<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        seq_in: &mut SeqTracker,
        seq_out: &mut u64,
    ) -> Result<Option<HelloInfo>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let frame = read_frame(reader).await?;
            if !seq_in.accept(frame.seq) {
                continue;
            }
            let FrameBody::Hello {
                node_id,
                display_name,
                token,
                platform,
                version,
                caps,
                commands,
                ..
            } = frame.body
            else {
                anyhow::bail!("Expected Hello, got another frame");
            };

            let token_ok = token
                .as_deref()
                .is_some_and(|t| self.pairing.verify_bridge_token(&node_id, t));
            let approved = token_ok || self.pairing.is_allowed(BRIDGE_PROVIDER, &node_id);

            if approved {
                // First attach after approval gets a fresh bearer token.
                let issued = if token_ok {
                    None
                } else {
                    Some(self.pairing.issue_bridge_token(&node_id)?)
                };
                *seq_out += 1;
                write_frame(
                    writer,
                    &BridgeFrame {
                        seq: *seq_out,
                        body: FrameBody::Welcome {
                            server_name: self.server_name.clone(),
                            capabilities: vec!["events".into(), "pairing".into()],
                            token: issued,
                        },
                    },
                )
                .await?;
                return Ok(Some(HelloInfo {
                    node_id,
                    display_name,
                    platform,
                    version,
                    caps,
                    commands,
                }));
            }

            let code = self.pairing.begin_pairing(BRIDGE_PROVIDER, &node_id)?;
            tracing::info!(node = %node_id, "Bridge node needs pairing");
            *seq_out += 1;
            write_frame(
                writer,
                &BridgeFrame {
                    seq: *seq_out,
                    body: FrameBody::Pair { code },
                },
            )
            .await?;
            // Loop: the node may retry Hello on this connection once the
            // owner approves; the handshake timeout bounds the wait.
        }
    }

    async fn read_loop<R: AsyncRead + Unpin>(
        &self,
        node_id: &str,
        reader: &mut R,
        tx: &mpsc::UnboundedSender<FrameBody>,
        seq_in: &mut SeqTracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                frame = read_frame(reader) => frame?,
            };
            if !seq_in.accept(frame.seq) {
                tracing::debug!(node = %node_id, seq = frame.seq, "Dropping out-of-order frame");
                continue;
            }
            self.touch(node_id);

            match frame.body {
                FrameBody::Ping { ts } => {
                    let _ = tx.send(FrameBody::Pong { ts });
                }
                FrameBody::Pong { .. } => {}
                FrameBody::Event { name, payload } => {
                    let _ = self.inbound.send(BridgeInbound {
                        node_id: node_id.to_string(),
                        name,
                        payload,
                    });
                }
                FrameBody::Goodbye { reason } => {
                    tracing::info!(node = %node_id, reason, "Node said goodbye");
                    return Ok(());
                }
                other => {
                    tracing::debug!(node = %node_id, "Ignoring unexpected frame: {other:?}");
                }
            }
        }
    }

    fn attach(
        &self,
        hello: &HelloInfo,
        tx: mpsc::UnboundedSender<FrameBody>,
        cancel: CancellationToken,
    ) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let now = now_ms();
        let info = BridgeSessionInfo {
            node_id: hello.node_id.clone(),
            display_name: hello.display_name.clone(),
            platform: hello.platform.clone(),
            version: hello.version.clone(),
            caps: hello.caps.clone(),
            commands: hello.commands.clone(),
            attached_at_ms: now,
            last_activity_ms: now,
        };

        let displaced = {
            let mut sessions = self.sessions.write();
            let displaced = sessions.remove(&hello.node_id);
            sessions.insert(
                hello.node_id.clone(),
                NodeHandle {
                    conn_id,
                    info,
                    tx,
                    cancel,
                },
            );
            displaced
        };

        if let Some(old) = displaced {
            tracing::info!(node = %hello.node_id, "Displacing previous bridge session");
            let _ = old.tx.send(FrameBody::Goodbye {
                reason: "displaced by newer attach".into(),
            });
            old.cancel.cancel();
        }
        tracing::info!(node = %hello.node_id, name = %hello.display_name, "Bridge node attached");
        conn_id
    }

    /// Remove our own registration. A displacing attach already replaced
    /// the entry, in which case the newer handle stays.
    fn detach(&self, node_id: &str, conn_id: u64) {
        let mut sessions = self.sessions.write();
        if sessions.get(node_id).is_some_and(|h| h.conn_id == conn_id) {
            sessions.remove(node_id);
            tracing::info!(node = %node_id, "Bridge node detached");
        }
    }

    fn touch(&self, node_id: &str) {
        if let Some(handle) = self.sessions.write().get_mut(node_id) {
            handle.info.last_activity_ms = now_ms();
        }
    }
}

struct HelloInfo {
    node_id: String,
    display_name: String,
    platform: String,
    version: String,
    caps: Vec<NodeCapability>,
    commands: Vec<String>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
