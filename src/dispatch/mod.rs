//! Reply Dispatcher — ordered, token-filtered, human-paced delivery.
//!
//! One dispatcher per surface/session pair. A single FIFO carries three
//! reply kinds; delivery is strictly serial, so a `final` never overtakes a
//! queued `tool`. Deliver errors are reported and consumed — the queue keeps
//! moving. Cancellation lets the in-flight delivery finish, short-circuits
//! any pending human delay, and drops everything still queued.

use crate::channels::{ReplyPayload, ReplySink};
use crate::config::{HumanDelayConfig, HumanDelayMode, RepliesConfig};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// A reply consisting solely of this token (optionally followed by
/// ` -- narration`) is dropped instead of delivered.
pub const SILENT_REPLY_TOKEN: &str = "[silent]";

/// Heartbeat ack marker; stripped from reply edges before delivery.
pub const HEARTBEAT_TOKEN: &str = "[HEARTBEAT_OK]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Tool,
    Block,
    Final,
}

impl ReplyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Block => "block",
            Self::Final => "final",
        }
    }
}

/// Queue depth per kind, as observed by `queued_counts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuedCounts {
    pub tool: usize,
    pub block: usize,
    pub r#final: usize,
}

impl QueuedCounts {
    pub fn total(self) -> usize {
        self.tool + self.block + self.r#final
    }
}

type HookFn = Box<dyn Fn() + Send + Sync>;
type ErrorHookFn = Box<dyn Fn(&anyhow::Error, ReplyKind) + Send + Sync>;

#[derive(Default)]
pub struct DispatcherOptions {
    pub response_prefix: Option<String>,
    pub human_delay: HumanDelayConfig,
    pub on_heartbeat_strip: Option<HookFn>,
    pub on_error: Option<ErrorHookFn>,
    pub on_idle: Option<HookFn>,
}

impl DispatcherOptions {
    pub fn from_config(config: &RepliesConfig) -> Self {
        Self {
            response_prefix: config.response_prefix.clone(),
            human_delay: config.human_delay.clone(),
            ..Self::default()
        }
    }
}

struct Shared {
    counts: Mutex<QueuedCounts>,
    high_water: AtomicUsize,
    idle_tx: watch::Sender<bool>,
}

struct QueueItem {
    kind: ReplyKind,
    payload: ReplyPayload,
}

pub struct ReplyDispatcher {
    tx: mpsc::UnboundedSender<QueueItem>,
    shared: Arc<Shared>,
    idle_rx: watch::Receiver<bool>,
}

impl ReplyDispatcher {
    pub fn new(
        sink: Arc<dyn ReplySink>,
        options: DispatcherOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (idle_tx, idle_rx) = watch::channel(true);
        let shared = Arc::new(Shared {
            counts: Mutex::new(QueuedCounts::default()),
            high_water: AtomicUsize::new(0),
            idle_tx,
        });

        let worker = Worker {
            sink,
            options,
            shared: shared.clone(),
            cancel,
            deliveries: 0,
            text_emitted: false,
        };
        tokio::spawn(worker.run(rx));

        Self {
            tx,
            shared,
            idle_rx,
        }
    }

    /// Enqueue one reply. The queue is unbounded; `high_water_mark` exposes
    /// the deepest it has been.
    pub fn enqueue(&self, kind: ReplyKind, payload: ReplyPayload) {
        {
            let mut counts = self.shared.counts.lock();
            match kind {
                ReplyKind::Tool => counts.tool += 1,
                ReplyKind::Block => counts.block += 1,
                ReplyKind::Final => counts.r#final += 1,
            }
            let depth = counts.total();
            self.shared.high_water.fetch_max(depth, Ordering::SeqCst);
            let _ = self.shared.idle_tx.send(false);
        }
        if self.tx.send(QueueItem { kind, payload }).is_err() {
            tracing::debug!("Reply dispatcher worker gone; dropping payload");
        }
    }

    pub fn queued_counts(&self) -> QueuedCounts {
        *self.shared.counts.lock()
    }

    pub fn high_water_mark(&self) -> usize {
        self.shared.high_water.load(Ordering::SeqCst)
    }

    /// Resolves when the queue has fully drained.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.idle_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct Worker {
    sink: Arc<dyn ReplySink>,
    options: DispatcherOptions,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    deliveries: u64,
    text_emitted: bool,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<QueueItem>) {
        loop {
            let item = tokio::select! {
                item = rx.recv() => item,
                () = self.cancel.cancelled() => {
                    self.drain(&mut rx);
                    return;
                }
            };
            let Some(item) = item else { return };
            self.process(item).await;
        }
    }

    fn drain(&self, rx: &mut mpsc::UnboundedReceiver<QueueItem>) {
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        let mut counts = self.shared.counts.lock();
        *counts = QueuedCounts::default();
        let _ = self.shared.idle_tx.send(true);
        if dropped > 0 {
            tracing::debug!(dropped, "Reply dispatcher aborted with queued payloads");
        }
    }

    async fn process(&mut self, item: QueueItem) {
        let QueueItem { kind, payload } = item;
        self.transform_and_deliver(kind, payload).await;

        let now_idle = {
            let mut counts = self.shared.counts.lock();
            match kind {
                ReplyKind::Tool => counts.tool = counts.tool.saturating_sub(1),
                ReplyKind::Block => counts.block = counts.block.saturating_sub(1),
                ReplyKind::Final => counts.r#final = counts.r#final.saturating_sub(1),
            }
            let idle = counts.total() == 0;
            if idle {
                // Inside the lock so an interleaved enqueue cannot be
                // overwritten by a stale idle notification.
                let _ = self.shared.idle_tx.send(true);
            }
            idle
        };

        if now_idle {
            if let Some(on_idle) = &self.options.on_idle {
                on_idle();
            }
        }
    }

    /// Apply the payload transformation pipeline, then deliver. Returns
    /// whether `deliver` was called.
    async fn transform_and_deliver(&mut self, kind: ReplyKind, payload: ReplyPayload) -> bool {
        let mut text = payload.text.clone();

        // 1. Silent replies vanish entirely.
        if is_silent_reply(&text) && !payload.has_media() {
            return false;
        }
        // 2. Nothing to say, nothing to show.
        if text.trim().is_empty() && !payload.has_media() {
            return false;
        }
        // 3. Heartbeat ack markers are stripped from the edges.
        let (stripped, removed) = strip_heartbeat_token(&text);
        if removed {
            if let Some(on_strip) = &self.options.on_heartbeat_strip {
                on_strip();
            }
        }
        text = stripped;
        if text.is_empty() && !payload.has_media() {
            return false;
        }
        // 4. Response prefix on the first non-empty outbound text.
        if !text.is_empty() && !self.text_emitted {
            if let Some(prefix) = &self.options.response_prefix {
                if !text.starts_with(prefix.as_str()) {
                    text = format!("{prefix} {text}");
                }
            }
            self.text_emitted = true;
        }

        // Human pacing for block replies after the first delivery.
        if kind == ReplyKind::Block && self.deliveries > 0 {
            if let Some(delay) = sample_human_delay(&self.options.human_delay) {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.cancel.cancelled() => {}
                }
            }
        }

        self.sink.on_reply_start().await;

        let outbound = ReplyPayload {
            text,
            media_url: payload.media_url,
            metadata: payload.metadata,
        };
        self.deliveries += 1;
        if let Err(err) = self.sink.deliver(outbound).await {
            tracing::warn!(kind = kind.as_str(), "Reply delivery failed: {err:#}");
            if let Some(on_error) = &self.options.on_error {
                on_error(&err, kind);
            }
        }
        true
    }
}

/// `[silent]`, optionally followed by ` -- narration`.
fn is_silent_reply(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed == SILENT_REPLY_TOKEN {
        return true;
    }
    trimmed
        .strip_prefix(SILENT_REPLY_TOKEN)
        .is_some_and(|rest| rest.trim_start().starts_with("--"))
}

/// Remove heartbeat ack tokens from both edges. Returns the remaining text
/// (whitespace-collapsed when anything was removed) and whether a token was
/// stripped.
fn strip_heartbeat_token(text: &str) -> (String, bool) {
    let mut current = text.trim();
    let mut removed = false;

    loop {
        if let Some(rest) = current.trim_start().strip_prefix(HEARTBEAT_TOKEN) {
            current = rest.trim_start();
            removed = true;
            continue;
        }
        if let Some(rest) = current.trim_end().strip_suffix(HEARTBEAT_TOKEN) {
            current = rest.trim_end();
            removed = true;
            continue;
        }
        break;
    }

    if removed {
        (crate::util::collapse_whitespace(current), true)
    } else {
        (current.trim().to_string(), false)
    }
}

fn sample_human_delay(config: &HumanDelayConfig) -> Option<Duration> {
    let (min_ms, max_ms) = match config.mode {
        HumanDelayMode::Off => return None,
        HumanDelayMode::Natural => (800, 1600),
        HumanDelayMode::Custom => {
            let min = config.min_ms;
            let max = if config.max_ms <= config.min_ms {
                config.min_ms
            } else {
                config.max_ms
            };
            (min, max)
        }
    };
    let sampled = if max_ms <= min_ms {
        min_ms
    } else {
        rand::rng().random_range(min_ms..=max_ms)
    };
    Some(Duration::from_millis(sampled))
}
