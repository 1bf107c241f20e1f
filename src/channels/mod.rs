//! Surface seams. Provider adapters (WhatsApp, Telegram, …) live outside
//! this crate; they hand inbound messages to admission and receive outbound
//! payloads through [`ReplySink`].

use async_trait::async_trait;

/// A message received from a chat surface.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    /// Provider name, e.g. `whatsapp`, `telegram`.
    pub provider: String,
    /// Originating principal (phone number, user id).
    pub peer: String,
    /// Provider message id when the surface supplies one; admission dedup
    /// is skipped without it.
    pub message_id: Option<String>,
    /// Reply address for the surface's send function.
    pub reply_to: String,
    pub content: String,
    /// Whether the message arrived in a group chat.
    pub is_group: bool,
    pub timestamp_ms: u64,
}

/// Outbound payload handed to a surface's send function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyPayload {
    pub text: String,
    pub media_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn has_media(&self) -> bool {
        self.media_url.is_some()
    }
}

/// Delivery seam implemented per surface/conversation.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Deliver one payload. Errors are reported but do not stop the queue.
    async fn deliver(&self, payload: ReplyPayload) -> anyhow::Result<()>;

    /// Fired once before each delivery; surfaces map this to a typing
    /// indicator. Fire-and-forget.
    async fn on_reply_start(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_without_media_reports_none() {
        let payload = ReplyPayload::text("hi");
        assert!(!payload.has_media());
        assert_eq!(payload.text, "hi");
    }
}
