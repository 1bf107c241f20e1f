//! Gateway assembly: builds every subsystem against one `Runtime` and runs
//! the long-lived tasks under a single cancellation tree.

use crate::admission::{AdmissionOutcome, AdmissionPipeline};
use crate::agent::{workspace, AgentRunner, RunParams};
use crate::bridge::{BridgeInbound, BridgeServer};
use crate::channels::{ChannelMessage, ReplyPayload, ReplySink};
use crate::commands::{Command, CommandContext, CommandOutcome, CommandPolicy, CommandRouter, FnHandler};
use crate::config::{Config, SessionScope};
use crate::cron::{
    AgentTurnPayload, CronExecutor, CronScheduler, CronStore, WakeMode,
};
use crate::dispatch::{DispatcherOptions, ReplyDispatcher};
use crate::discovery::{Beacon, DiscoveryPublisher};
use crate::heartbeat::HeartbeatDriver;
use crate::pairing::PairingStore;
use crate::plugins::{Plugin, PluginRegistry};
use crate::providers::ModelBackend;
use crate::runtime::Runtime;
use crate::session::{SessionKey, SessionStore};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Marker for cron-queued lines in HEARTBEAT.md.
const QUEUE_MARKER: &str = "[queued]";

const AGENT_ID: &str = "main";

const CORE_TOOLS: [&str; 8] = ["read", "write", "edit", "grep", "find", "ls", "bash", "process"];

/// Fallback sink for turns with no live surface (heartbeats in a headless
/// gateway): deliveries go to the log.
pub struct LogSink;

#[async_trait]
impl ReplySink for LogSink {
    async fn deliver(&self, payload: ReplyPayload) -> Result<()> {
        tracing::info!("Assistant: {}", payload.text);
        Ok(())
    }
}

pub struct Gateway {
    runtime: Runtime,
    config: Arc<Config>,
    workspace_dir: PathBuf,
    store: Arc<SessionStore>,
    runner: Arc<AgentRunner>,
    pairing: Arc<PairingStore>,
    admission: Arc<AdmissionPipeline>,
    cron: Arc<CronScheduler>,
    heartbeat: Arc<HeartbeatDriver>,
    bridge: Arc<BridgeServer>,
    bridge_inbound: Mutex<Option<mpsc::UnboundedReceiver<BridgeInbound>>>,
    plugins: PluginRegistry,
}

impl Gateway {
    /// Wire every subsystem. Nothing is spawned until [`Gateway::run`].
    pub fn build(
        runtime: Runtime,
        mut config: Config,
        backend: Arc<dyn ModelBackend>,
        plugins: Vec<Box<dyn Plugin>>,
        surface_sink: Arc<dyn ReplySink>,
    ) -> Result<Arc<Self>> {
        config.apply_env_overrides();
        let config = Arc::new(config);

        let workspace_dir = workspace::resolve_workspace(
            config.agent.workspace.as_deref(),
            runtime.profile(),
        )?;
        let store = Arc::new(SessionStore::open(&runtime.sessions_dir(AGENT_ID)));
        let pairing = Arc::new(PairingStore::open(&runtime.pairing_path()));
        let runner = Arc::new(AgentRunner::new(
            runtime.clone(),
            config.clone(),
            store.clone(),
            backend,
            AGENT_ID,
        ));

        let dispatcher = Arc::new(ReplyDispatcher::new(
            surface_sink,
            DispatcherOptions::from_config(&config.replies),
            CancellationToken::new(),
        ));
        let heartbeat = Arc::new(HeartbeatDriver::new(
            config.heartbeat.clone(),
            runner.clone(),
            dispatcher,
            workspace_dir.clone(),
        ));

        let cron_path = config
            .cron
            .store
            .as_deref()
            .map_or_else(|| runtime.cron_jobs_path(), |p| crate::util::expand_tilde(p));
        let cron_store = Arc::new(CronStore::open(&cron_path));
        let executor = Arc::new(GatewayCronExecutor {
            runner: runner.clone(),
            heartbeat: heartbeat.clone(),
            workspace_dir: workspace_dir.clone(),
        });
        let cron = Arc::new(CronScheduler::new(cron_store, executor));

        let router = build_router(
            &config,
            store.clone(),
            runner.clone(),
            pairing.clone(),
            cron.clone(),
        );
        let admission = Arc::new(AdmissionPipeline::new(
            config.clone(),
            router,
            runner.clone(),
        ));

        let (bridge_tx, bridge_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(BridgeServer::new(
            config.bridge.clone(),
            pairing.clone(),
            display_name(&config),
            bridge_tx,
        ));

        let core_tools: Vec<String> = CORE_TOOLS.iter().map(|s| (*s).to_string()).collect();
        let plugins = PluginRegistry::load(plugins, &config.plugins, &core_tools);

        Ok(Arc::new(Self {
            runtime,
            config,
            workspace_dir,
            store,
            runner,
            pairing,
            admission,
            cron,
            heartbeat,
            bridge,
            bridge_inbound: Mutex::new(Some(bridge_rx)),
            plugins,
        }))
    }

    pub fn admission(&self) -> &Arc<AdmissionPipeline> {
        &self.admission
    }

    pub fn cron(&self) -> &Arc<CronScheduler> {
        &self.cron
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn pairing(&self) -> &Arc<PairingStore> {
        &self.pairing
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn runner(&self) -> &Arc<AgentRunner> {
        &self.runner
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    /// Spawn the long-lived subsystems and park until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if self.config.cron.enabled {
            let cron = self.cron.clone();
            let child = cancel.child_token();
            tokio::spawn(async move {
                if let Err(err) = cron.run(child).await {
                    tracing::error!("Cron scheduler stopped: {err:#}");
                }
            });
        } else {
            tracing::info!("Cron scheduler disabled");
        }

        if self.config.heartbeat.enabled {
            let heartbeat = self.heartbeat.clone();
            let child = cancel.child_token();
            tokio::spawn(async move {
                if let Err(err) = heartbeat.run(child).await {
                    tracing::error!("Heartbeat driver stopped: {err:#}");
                }
            });
        }

        if self.config.bridge.enabled {
            let bridge = self.bridge.clone();
            let child = cancel.child_token();
            tokio::spawn(async move {
                if let Err(err) = bridge.run(child).await {
                    tracing::error!("Bridge server stopped: {err:#}");
                }
            });
            self.clone().spawn_bridge_pump(&cancel);
        }

        if self.config.discovery.enabled {
            let beacon = self.build_beacon();
            let publisher = DiscoveryPublisher::new(
                beacon,
                self.config.discovery.wide_area.enabled,
                self.runtime.state_dir().to_path_buf(),
            );
            let child = cancel.child_token();
            tokio::spawn(async move {
                if let Err(err) = publisher.run(child).await {
                    tracing::error!("Discovery publisher stopped: {err:#}");
                }
            });
        }

        for service in self.plugins.services() {
            let service = service.clone();
            let child = cancel.child_token();
            tokio::spawn(async move {
                if let Err(err) = service.run(child).await {
                    tracing::error!(service = service.id(), "Plugin service stopped: {err:#}");
                }
            });
        }

        tracing::info!("Gateway up");
        cancel.cancelled().await;
        tracing::info!("Gateway shutting down");
        Ok(())
    }

    /// Forward node events into admission, replying over the bridge.
    fn spawn_bridge_pump(self: Arc<Self>, cancel: &CancellationToken) {
        let Some(mut rx) = self.bridge_inbound.lock().take() else {
            return;
        };
        let gateway = self;
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            loop {
                let inbound = tokio::select! {
                    () = cancel.cancelled() => return,
                    inbound = rx.recv() => inbound,
                };
                let Some(inbound) = inbound else { return };
                gateway.handle_bridge_inbound(inbound, &cancel).await;
            }
        });
    }

    async fn handle_bridge_inbound(&self, inbound: BridgeInbound, cancel: &CancellationToken) {
        let text = inbound
            .payload
            .get("text")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        if text.is_empty() {
            tracing::debug!(node = %inbound.node_id, event = %inbound.name, "Ignoring non-text node event");
            return;
        }
        let message = ChannelMessage {
            provider: "bridge".to_string(),
            peer: inbound.node_id.clone(),
            message_id: inbound
                .payload
                .get("messageId")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            reply_to: inbound.node_id.clone(),
            content: text,
            is_group: false,
            timestamp_ms: chrono::Utc::now().timestamp_millis().unsigned_abs(),
        };

        match self.admission.admit(&message, cancel.child_token()).await {
            Ok(AdmissionOutcome::AgentResponse(run)) => {
                let _ = self.bridge.send_event(
                    &inbound.node_id,
                    "reply",
                    serde_json::json!({"text": run.response}),
                );
            }
            Ok(AdmissionOutcome::CommandReply(reply)) => {
                let _ = self.bridge.send_event(
                    &inbound.node_id,
                    "reply",
                    serde_json::json!({"text": reply}),
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(node = %inbound.node_id, "Bridge admission failed: {err:#}");
            }
        }
    }

    fn build_beacon(&self) -> Beacon {
        let mut beacon = Beacon::gateway(display_name(&self.config), display_name(&self.config));
        beacon.bridge_port = Some(self.config.bridge.port);
        beacon.with_env_overrides()
    }
}

fn display_name(config: &Config) -> String {
    config
        .discovery
        .display_name
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "Clawdbot Gateway".to_string())
}

/// Session key a command context resolves to under the configured scope.
fn command_session_key(config: &Config, runner: &AgentRunner, ctx: &CommandContext) -> SessionKey {
    match config.session.scope {
        SessionScope::Global => runner.main_session_key(),
        SessionScope::PerSender => {
            SessionKey::direct(runner.agent_id(), &ctx.provider, &ctx.peer)
        }
    }
}

fn build_router(
    config: &Arc<Config>,
    store: Arc<SessionStore>,
    runner: Arc<AgentRunner>,
    pairing: Arc<PairingStore>,
    cron: Arc<CronScheduler>,
) -> CommandRouter {
    let mut router = CommandRouter::new(pairing.clone());

    router.register(Command::new(
        "help",
        &["help"],
        false,
        CommandPolicy::default(),
        Arc::new(FnHandler(|_ctx: CommandContext| async {
            Ok(CommandOutcome::Reply(
                "Commands: /help, /status, /new (reset session), /pairing approve <provider> <code>"
                    .to_string(),
            ))
        })),
    ));

    let status_store = store.clone();
    let status_cron = cron.clone();
    router.register(Command::new(
        "status",
        &["status"],
        false,
        CommandPolicy::default(),
        Arc::new(FnHandler(move |_ctx: CommandContext| {
            let store = status_store.clone();
            let cron = status_cron.clone();
            async move {
                let sessions = store.list().len();
                let cron_status = cron.status();
                Ok(CommandOutcome::Reply(format!(
                    "Sessions: {sessions} · Cron jobs: {} ({} enabled)",
                    cron_status.jobs, cron_status.enabled_jobs
                )))
            }
        })),
    ));

    let reset_config = config.clone();
    let reset_store = store;
    let reset_runner = runner;
    router.register(Command::new(
        "new",
        &["new", "reset"],
        false,
        CommandPolicy {
            requires_auth: true,
            ..CommandPolicy::default()
        },
        Arc::new(FnHandler(move |ctx: CommandContext| {
            let config = reset_config.clone();
            let store = reset_store.clone();
            let runner = reset_runner.clone();
            async move {
                let key = command_session_key(&config, &runner, &ctx);
                let session = store.reset(&key)?;
                Ok(CommandOutcome::Reply(format!(
                    "Fresh session started ({}).",
                    &session.id[..8.min(session.id.len())]
                )))
            }
        })),
    ));

    let approve_pairing = pairing;
    router.register(Command::new(
        "pairing",
        &["pairing"],
        true,
        CommandPolicy {
            requires_auth: true,
            ..CommandPolicy::default()
        },
        Arc::new(FnHandler(move |ctx: CommandContext| {
            let pairing = approve_pairing.clone();
            async move {
                let parts: Vec<&str> = ctx.args.split_whitespace().collect();
                match parts.as_slice() {
                    ["approve", provider, code] => match pairing.approve(provider, code)? {
                        Some(principal) => Ok(CommandOutcome::Reply(format!(
                            "Approved {principal} on {provider}."
                        ))),
                        None => Ok(CommandOutcome::Reply(
                            "Unknown or expired pairing code.".to_string(),
                        )),
                    },
                    _ => Ok(CommandOutcome::Reply(
                        "Usage: pairing approve <provider> <code>".to_string(),
                    )),
                }
            }
        })),
    ));

    router
}

// ── Cron payload execution ───────────────────────────────────────

struct GatewayCronExecutor {
    runner: Arc<AgentRunner>,
    heartbeat: Arc<HeartbeatDriver>,
    workspace_dir: PathBuf,
}

impl GatewayCronExecutor {
    async fn queue_and_wake(&self, line: &str, wake_mode: WakeMode) -> Result<()> {
        append_queued_task(&self.workspace_dir, line)?;
        if wake_mode == WakeMode::Now {
            self.heartbeat.trigger_now().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CronExecutor for GatewayCronExecutor {
    async fn enqueue_system_event(&self, text: &str, wake_mode: WakeMode) -> Result<()> {
        self.queue_and_wake(&format!("[System] {text}"), wake_mode).await
    }

    async fn enqueue_main_turn(
        &self,
        payload: &AgentTurnPayload,
        wake_mode: WakeMode,
    ) -> Result<()> {
        self.queue_and_wake(&payload.message, wake_mode).await
    }

    async fn run_isolated_turn(&self, payload: &AgentTurnPayload) -> Result<String> {
        let key = SessionKey::raw(format!(
            "agent:{}:cron:{}",
            self.runner.agent_id(),
            uuid::Uuid::new_v4()
        ));
        let mut params = RunParams::new(payload.message.clone());
        params.session_key = Some(key);
        params.suppress_directives = true;
        params.thinking_level = payload
            .thinking
            .as_deref()
            .and_then(crate::directives::ThinkLevel::parse);
        let outcome = self.runner.run(params).await?;
        Ok(outcome.response)
    }

    async fn post_to_main(&self, text: &str) -> Result<()> {
        append_queued_task(&self.workspace_dir, text)
    }

    async fn wake(&self, mode: WakeMode, text: Option<&str>, reason: Option<&str>) -> Result<()> {
        if let Some(text) = text {
            append_queued_task(&self.workspace_dir, text)?;
        }
        if mode == WakeMode::Now {
            tracing::debug!(reason = reason.unwrap_or("-"), "Wake requested");
            self.heartbeat.trigger_now().await?;
        }
        Ok(())
    }
}

/// Queue a task line into HEARTBEAT.md for the next heartbeat, skipping
/// exact duplicates.
fn append_queued_task(workspace_dir: &Path, task: &str) -> Result<()> {
    let path = workspace_dir.join("HEARTBEAT.md");
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &path,
            "# Periodic Tasks\n\nAdd tasks below (one per line, starting with `- `)\n",
        )?;
    }
    let mut content = std::fs::read_to_string(&path).unwrap_or_default();
    let line = format!("- {QUEUE_MARKER} {task}");
    if content.lines().any(|l| l.trim_end() == line) {
        return Ok(());
    }
    if !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&line);
    content.push('\n');
    std::fs::write(&path, content)?;
    Ok(())
}
