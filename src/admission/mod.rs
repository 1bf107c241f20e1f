//! Inbound admission pipeline: dedup → command routing → fast-abort →
//! agent turn.
//!
//! Every inbound path (provider adapters, cron, bridge nodes) funnels
//! through `admit`, so the dedup window, the command registry, and the
//! single-flight session discipline apply uniformly.

use crate::agent::{AgentRunner, RunOutcome, RunParams};
use crate::channels::ChannelMessage;
use crate::commands::{CommandOutcome, CommandRouter};
use crate::config::{Config, SessionScope};
use crate::dedup::{InboundDedup, InboundKey};
use crate::session::SessionKey;
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Messages that abort an in-flight turn instead of queueing behind it.
const FAST_ABORT_WORDS: [&str; 4] = ["stop", "abort", "cancel", "wait"];

#[derive(Debug)]
pub enum AdmissionOutcome {
    /// Replay within the dedup TTL; dropped silently.
    DuplicateSkipped,
    /// A command consumed the message and wants this reply sent.
    CommandReply(String),
    /// A command consumed the message silently.
    CommandSilent,
    /// A fast-abort word cancelled the in-flight turn for this session.
    Aborted,
    /// A full agent turn ran.
    AgentResponse(RunOutcome),
}

pub struct AdmissionPipeline {
    config: Arc<Config>,
    dedup: InboundDedup,
    router: CommandRouter,
    runner: Arc<AgentRunner>,
}

impl AdmissionPipeline {
    pub fn new(config: Arc<Config>, router: CommandRouter, runner: Arc<AgentRunner>) -> Self {
        Self {
            config,
            dedup: InboundDedup::new(),
            router,
            runner,
        }
    }

    pub fn runner(&self) -> &Arc<AgentRunner> {
        &self.runner
    }

    /// Session key for an inbound message under the configured scope.
    pub fn session_key_for(&self, message: &ChannelMessage) -> SessionKey {
        match self.config.session.scope {
            SessionScope::Global => self.runner.main_session_key(),
            SessionScope::PerSender => SessionKey::direct(
                self.runner.agent_id(),
                &message.provider,
                &message.peer,
            ),
        }
    }

    /// Admit one inbound message. See module docs for the stage order.
    pub async fn admit(
        &self,
        message: &ChannelMessage,
        cancel: CancellationToken,
    ) -> Result<AdmissionOutcome> {
        let session_key = self.session_key_for(message);

        if self.dedup.should_skip(&InboundKey {
            provider: &message.provider,
            peer: &message.peer,
            message_id: message.message_id.as_deref(),
            session_key: Some(session_key.as_str()),
        }) {
            tracing::debug!(
                provider = %message.provider,
                peer = %message.peer,
                "Duplicate inbound suppressed"
            );
            return Ok(AdmissionOutcome::DuplicateSkipped);
        }

        let is_main = session_key == self.runner.main_session_key();
        match self.router.route(message, is_main).await {
            CommandOutcome::Reply(reply) => return Ok(AdmissionOutcome::CommandReply(reply)),
            CommandOutcome::Silent => return Ok(AdmissionOutcome::CommandSilent),
            CommandOutcome::PassThrough => {}
        }

        if is_fast_abort(&message.content)
            && self.runner.is_active(&session_key)
            && self.runner.abort_active(&session_key)
        {
            tracing::info!(key = %session_key, "Fast-abort cancelled in-flight turn");
            return Ok(AdmissionOutcome::Aborted);
        }

        let mut params = RunParams::new(message.content.clone());
        params.session_key = Some(session_key);
        params.cancel = cancel;
        let outcome = self.runner.run(params).await?;
        Ok(AdmissionOutcome::AgentResponse(outcome))
    }
}

fn is_fast_abort(text: &str) -> bool {
    let normalized = crate::util::collapse_whitespace(text).to_lowercase();
    FAST_ABORT_WORDS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::AgentEvent;
    use crate::commands::{Command, CommandContext, CommandPolicy, FnHandler};
    use crate::pairing::PairingStore;
    use crate::providers::{ModelBackend, TurnOutcome, TurnRequest};
    use crate::runtime::Runtime;
    use crate::session::SessionStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct EchoBackend {
        delay: Duration,
    }

    #[async_trait]
    impl ModelBackend for EchoBackend {
        async fn run_turn(
            &self,
            request: TurnRequest,
            _events: mpsc::UnboundedSender<AgentEvent>,
            cancel: CancellationToken,
        ) -> anyhow::Result<TurnOutcome> {
            if !self.delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(self.delay) => {}
                    () = cancel.cancelled() => {
                        return Err(anyhow::Error::new(crate::providers::Cancelled));
                    }
                }
            }
            Ok(TurnOutcome {
                text: format!("echo: {}", request.message),
                usage: None,
            })
        }
    }

    fn pipeline(tmp: &tempfile::TempDir, delay: Duration) -> Arc<AdmissionPipeline> {
        let runtime = Runtime::rooted_at(tmp.path());
        let mut config = Config::default();
        config.agent.workspace = Some(tmp.path().join("ws").to_string_lossy().into_owned());
        let config = Arc::new(config);
        let store = Arc::new(SessionStore::open(&tmp.path().join("sessions")));
        let runner = Arc::new(AgentRunner::new(
            runtime,
            config.clone(),
            store,
            Arc::new(EchoBackend { delay }),
            "main",
        ));

        let pairing = Arc::new(PairingStore::open(&tmp.path().join("pairing.json")));
        let mut router = CommandRouter::new(pairing);
        router.register(Command::new(
            "status",
            &["status"],
            false,
            CommandPolicy::default(),
            Arc::new(FnHandler(|_ctx: CommandContext| async {
                Ok(CommandOutcome::Reply("gateway up".into()))
            })),
        ));

        Arc::new(AdmissionPipeline::new(config, router, runner))
    }

    fn message(content: &str, id: &str) -> ChannelMessage {
        ChannelMessage {
            provider: "whatsapp".into(),
            peer: "+15555550123".into(),
            message_id: Some(id.into()),
            reply_to: "+15555550123".into(),
            content: content.into(),
            is_group: false,
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn duplicate_within_ttl_reaches_the_runner_once() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&tmp, Duration::ZERO);

        let first = pipeline
            .admit(&message("hello", "msg-1"), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(first, AdmissionOutcome::AgentResponse(_)));

        let second = pipeline
            .admit(&message("hello", "msg-1"), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(second, AdmissionOutcome::DuplicateSkipped));
    }

    #[tokio::test]
    async fn commands_short_circuit_before_the_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&tmp, Duration::ZERO);

        let outcome = pipeline
            .admit(&message("/status", "msg-2"), CancellationToken::new())
            .await
            .unwrap();
        let AdmissionOutcome::CommandReply(reply) = outcome else {
            panic!("expected command reply");
        };
        assert_eq!(reply, "gateway up");
    }

    #[tokio::test]
    async fn plain_text_runs_an_agent_turn() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&tmp, Duration::ZERO);

        let outcome = pipeline
            .admit(&message("what's new", "msg-3"), CancellationToken::new())
            .await
            .unwrap();
        let AdmissionOutcome::AgentResponse(run) = outcome else {
            panic!("expected agent response");
        };
        assert_eq!(run.response, "echo: what's new");
    }

    #[tokio::test]
    async fn stop_aborts_the_inflight_turn() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&tmp, Duration::from_millis(300));

        let slow = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .admit(&message("long task", "msg-4"), CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = pipeline
            .admit(&message("stop", "msg-5"), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, AdmissionOutcome::Aborted));

        let err = slow.await.unwrap().unwrap_err();
        assert!(crate::providers::is_cancellation(&err));
    }

    #[tokio::test]
    async fn stop_without_inflight_turn_goes_to_the_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&tmp, Duration::ZERO);

        let outcome = pipeline
            .admit(&message("stop", "msg-6"), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, AdmissionOutcome::AgentResponse(_)));
    }
}
