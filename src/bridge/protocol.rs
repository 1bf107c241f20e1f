//! Bridge wire protocol: length-prefixed JSON frames.
//!
//! Every frame is a `u32` big-endian byte length followed by one JSON
//! object carrying an increasing `seq`. Receivers drop out-of-order frames.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are a protocol error.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Accept-to-Welcome deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Each side pings on this cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Missing this many consecutive pings closes the connection.
pub const MAX_MISSED_PINGS: u32 = 2;

/// Node capabilities negotiated at attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeCapability {
    Canvas,
    Screen,
    Camera,
    VoiceWake,
    Location,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FrameBody {
    #[serde(rename_all = "camelCase")]
    Hello {
        node_id: String,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        platform: String,
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_family: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_identifier: Option<String>,
        #[serde(default)]
        caps: Vec<NodeCapability>,
        #[serde(default)]
        commands: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Welcome {
        server_name: String,
        capabilities: Vec<String>,
        /// Issued on first attach after approval; nodes persist it and
        /// present it on subsequent Hellos.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Pair {
        code: String,
    },
    Ping {
        ts: i64,
    },
    Pong {
        ts: i64,
    },
    /// Node-originated admission (voice wake transcript, canvas action, …).
    Event {
        name: String,
        payload: serde_json::Value,
    },
    Goodbye {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeFrame {
    pub seq: u64,
    #[serde(flatten)]
    pub body: FrameBody,
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &BridgeFrame) -> Result<()> {
    let payload = serde_json::to_vec(frame).context("Failed to encode bridge frame")?;
    if payload.len() > MAX_FRAME_BYTES {
        anyhow::bail!("Refusing to send oversized frame ({} bytes)", payload.len());
    }
    writer
        .write_all(&u32::try_from(payload.len())?.to_be_bytes())
        .await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<BridgeFrame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("Oversized frame ({len} bytes)");
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).context("Malformed bridge frame")
}

/// Receiver-side ordering: frames must arrive with strictly increasing seq.
#[derive(Debug, Default)]
pub struct SeqTracker {
    last: Option<u64>,
}

impl SeqTracker {
    /// Returns false (drop the frame) when `seq` does not advance.
    pub fn accept(&mut self, seq: u64) -> bool {
        match self.last {
            Some(last) if seq <= last => false,
            _ => {
                self.last = Some(seq);
                true
            }
        }
    }
}
