//! Heartbeat driver: timer-driven agent turns with silent-ack suppression.
//!
//! Every interval the driver runs the main session with the heartbeat
//! prompt. A response that is just the ack token (give or take a few chars
//! of narration) stays silent; anything else is delivered.

use crate::agent::{AgentRunner, RunParams};
use crate::channels::ReplyPayload;
use crate::config::HeartbeatConfig;
use crate::dispatch::{ReplyDispatcher, ReplyKind, HEARTBEAT_TOKEN};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEFAULT_PROMPT: &str =
    "Read HEARTBEAT.md in the workspace. Work any queued task, then reply [HEARTBEAT_OK] if nothing needs the user's attention.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// A turn ran; `delivered` tells whether the reply went out or was
    /// suppressed as a silent ack.
    Ran { delivered: bool },
    /// Another heartbeat was already in flight.
    Skipped,
}

pub struct HeartbeatDriver {
    config: HeartbeatConfig,
    runner: Arc<AgentRunner>,
    dispatcher: Arc<ReplyDispatcher>,
    workspace_dir: PathBuf,
    /// Re-entrancy gate for `trigger_now`.
    running: tokio::sync::Mutex<()>,
}

impl HeartbeatDriver {
    pub fn new(
        config: HeartbeatConfig,
        runner: Arc<AgentRunner>,
        dispatcher: Arc<ReplyDispatcher>,
        workspace_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            runner,
            dispatcher,
            workspace_dir,
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Tick on the configured cadence until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let period = crate::util::parse_interval(&self.config.interval)?;
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        tracing::info!(interval = %self.config.interval, "Heartbeat driver started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }
            match self.trigger_now().await {
                Ok(HeartbeatOutcome::Skipped) => {
                    tracing::debug!("Heartbeat tick skipped; previous still running");
                }
                Ok(HeartbeatOutcome::Ran { delivered }) => {
                    tracing::debug!(delivered, "Heartbeat tick completed");
                }
                Err(err) => {
                    tracing::warn!("Heartbeat turn failed: {err:#}");
                }
            }
        }
    }

    /// Run one heartbeat immediately. Returns `Skipped` when one is already
    /// in flight.
    pub async fn trigger_now(&self) -> Result<HeartbeatOutcome> {
        let Ok(_guard) = self.running.try_lock() else {
            return Ok(HeartbeatOutcome::Skipped);
        };

        let prompt = self.resolve_prompt();
        let mut params = RunParams::new(prompt);
        params.suppress_directives = true;
        let outcome = self.runner.run(params).await?;

        if is_heartbeat_ack(&outcome.response, self.config.ack_max_chars) {
            tracing::debug!("Heartbeat ack suppressed");
            return Ok(HeartbeatOutcome::Ran { delivered: false });
        }

        self.dispatcher
            .enqueue(ReplyKind::Final, ReplyPayload::text(outcome.response));
        Ok(HeartbeatOutcome::Ran { delivered: true })
    }

    fn resolve_prompt(&self) -> String {
        if let Some(prompt) = &self.config.prompt {
            if !prompt.trim().is_empty() {
                return prompt.clone();
            }
        }
        match std::fs::read_to_string(self.workspace_dir.join("HEARTBEAT.md")) {
            Ok(content) if !content.trim().is_empty() => content,
            _ => DEFAULT_PROMPT.to_string(),
        }
    }
}

/// True when the response consists solely of the ack token plus at most
/// `ack_max_chars` of surrounding narration.
pub fn is_heartbeat_ack(text: &str, ack_max_chars: usize) -> bool {
    if !text.contains(HEARTBEAT_TOKEN) {
        return false;
    }
    let remainder: String = text.replace(HEARTBEAT_TOKEN, " ");
    crate::util::collapse_whitespace(&remainder).chars().count() <= ack_max_chars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::AgentEvent;
    use crate::config::Config;
    use crate::dispatch::DispatcherOptions;
    use crate::providers::{ModelBackend, TurnOutcome, TurnRequest};
    use crate::runtime::Runtime;
    use crate::session::SessionStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    struct CannedBackend {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelBackend for CannedBackend {
        async fn run_turn(
            &self,
            _request: TurnRequest,
            _events: mpsc::UnboundedSender<AgentEvent>,
            _cancel: CancellationToken,
        ) -> anyhow::Result<TurnOutcome> {
            let text = self.responses.lock().pop().unwrap_or_default();
            Ok(TurnOutcome { text, usage: None })
        }
    }

    struct CollectingSink {
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl crate::channels::ReplySink for CollectingSink {
        async fn deliver(&self, payload: ReplyPayload) -> anyhow::Result<()> {
            self.delivered.lock().push(payload.text);
            Ok(())
        }
    }

    fn driver_with(
        response: &str,
        tmp: &tempfile::TempDir,
    ) -> (Arc<HeartbeatDriver>, Arc<CollectingSink>, Arc<ReplyDispatcher>) {
        let runtime = Runtime::rooted_at(tmp.path());
        let mut config = Config::default();
        let workspace = tmp.path().join("ws");
        config.agent.workspace = Some(workspace.to_string_lossy().into_owned());
        let store = Arc::new(SessionStore::open(&tmp.path().join("sessions")));
        let backend = Arc::new(CannedBackend {
            responses: Mutex::new(vec![response.to_string()]),
        });
        let runner = Arc::new(AgentRunner::new(
            runtime,
            Arc::new(config),
            store,
            backend,
            "main",
        ));

        let sink = Arc::new(CollectingSink {
            delivered: Mutex::new(Vec::new()),
        });
        let dispatcher = Arc::new(ReplyDispatcher::new(
            sink.clone(),
            DispatcherOptions::default(),
            CancellationToken::new(),
        ));
        let driver = Arc::new(HeartbeatDriver::new(
            HeartbeatConfig::default(),
            runner,
            dispatcher.clone(),
            workspace,
        ));
        (driver, sink, dispatcher)
    }

    #[test]
    fn ack_detection_tolerates_short_narration() {
        assert!(is_heartbeat_ack("[HEARTBEAT_OK]", 30));
        assert!(is_heartbeat_ack("[HEARTBEAT_OK] all quiet", 30));
        assert!(is_heartbeat_ack("ok [HEARTBEAT_OK]", 30));
        assert!(!is_heartbeat_ack(
            "[HEARTBEAT_OK] but three tasks failed and the disk is filling up",
            30
        ));
        assert!(!is_heartbeat_ack("all good", 30));
    }

    #[tokio::test]
    async fn silent_ack_is_suppressed() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, sink, dispatcher) = driver_with("[HEARTBEAT_OK] all quiet", &tmp);

        let outcome = driver.trigger_now().await.unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Ran { delivered: false });

        dispatcher.wait_for_idle().await;
        assert!(sink.delivered.lock().is_empty());
    }

    #[tokio::test]
    async fn substantive_response_is_delivered() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, sink, dispatcher) = driver_with(
            "Reminder: the backup job has been failing since Tuesday.",
            &tmp,
        );

        let outcome = driver.trigger_now().await.unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Ran { delivered: true });

        dispatcher.wait_for_idle().await;
        let delivered = sink.delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].contains("backup job"));
    }
}
