//! Agent Runner — single-flight per session key, context assembly, model
//! fallback chain, streaming dispatch.
//!
//! Turns for the same session key serialize in admission order. A new run
//! with `abort_previous` cancels the in-flight turn first. Aborted turns
//! never update session token counters.

use crate::agent::events::AgentEvent;
use crate::agent::{prompt, skills, workspace};
use crate::config::Config;
use crate::directives::{self, ParsedDirectives, ThinkLevel};
use crate::providers::{
    self, Cancelled, ContextFile, FallbackAttempt, FallbackError, ModelBackend, ModelRef,
    TurnOutcome, TurnRequest,
};
use crate::runtime::Runtime;
use crate::session::transcript::Transcript;
use crate::session::{SessionKey, SessionPatch, SessionStore, TokenTotals};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Parameters for one agent turn.
pub struct RunParams {
    pub message: String,
    pub session_key: Option<SessionKey>,
    /// Overrides session/config thinking when set.
    pub thinking_level: Option<ThinkLevel>,
    /// Cancel the in-flight turn for this key instead of queueing behind it.
    pub abort_previous: bool,
    /// Skip `/think`/`/verbose` extraction (heartbeats, cron payloads).
    pub suppress_directives: bool,
    /// Load daily memory logs into context.
    pub load_memory: bool,
    pub cancel: CancellationToken,
    /// Streaming sink; events are dropped when absent.
    pub events: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl RunParams {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_key: None,
            thinking_level: None,
            abort_previous: false,
            suppress_directives: false,
            load_memory: true,
            cancel: CancellationToken::new(),
            events: None,
        }
    }
}

/// Result of a completed turn.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub response: String,
    pub session_id: String,
    pub session_key: SessionKey,
    pub usage: Option<TokenTotals>,
    pub model: Option<ModelRef>,
    pub directives: Option<ParsedDirectives>,
}

#[derive(Default)]
struct Flight {
    gate: Arc<tokio::sync::Mutex<()>>,
    active: Option<CancellationToken>,
    pending: usize,
}

pub struct AgentRunner {
    runtime: Runtime,
    config: Arc<Config>,
    store: Arc<SessionStore>,
    backend: Arc<dyn ModelBackend>,
    agent_id: String,
    bundled_skills_dir: Option<PathBuf>,
    flights: Mutex<HashMap<String, Flight>>,
}

impl AgentRunner {
    pub fn new(
        runtime: Runtime,
        config: Arc<Config>,
        store: Arc<SessionStore>,
        backend: Arc<dyn ModelBackend>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            config,
            store,
            backend,
            agent_id: agent_id.into(),
            bundled_skills_dir: None,
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Directory of skills shipped with the install, searched first.
    pub fn with_bundled_skills_dir(mut self, dir: PathBuf) -> Self {
        self.bundled_skills_dir = Some(dir);
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The key a turn lands on when the caller names none.
    pub fn main_session_key(&self) -> SessionKey {
        match &self.config.session.main_key {
            Some(key) => SessionKey::raw(key.clone()),
            None => SessionKey::main(&self.agent_id),
        }
    }

    /// Cancel the in-flight turn for `key`, if any. Returns whether one was
    /// cancelled.
    pub fn abort_active(&self, key: &SessionKey) -> bool {
        let flights = self.flights.lock();
        if let Some(flight) = flights.get(key.as_str()) {
            if let Some(token) = &flight.active {
                token.cancel();
                return true;
            }
        }
        false
    }

    /// Whether a turn is currently in flight for `key`.
    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.flights
            .lock()
            .get(key.as_str())
            .is_some_and(|flight| flight.active.is_some())
    }

    /// Run one agent turn. See module docs for the single-flight contract.
    pub async fn run(&self, params: RunParams) -> Result<RunOutcome> {
        let key = params
            .session_key
            .clone()
            .unwrap_or_else(|| self.main_session_key());

        let gate = self.enter_flight(&key, params.abort_previous);
        let _permit = gate.lock().await;
        self.mark_running(&key, &params.cancel);

        let result = self.run_locked(&key, &params).await;

        self.leave_flight(&key);
        result
    }

    fn enter_flight(&self, key: &SessionKey, abort_previous: bool) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock();
        let flight = flights.entry(key.as_str().to_string()).or_default();
        flight.pending += 1;
        if abort_previous {
            if let Some(token) = &flight.active {
                token.cancel();
            }
        }
        flight.gate.clone()
    }

    fn mark_running(&self, key: &SessionKey, cancel: &CancellationToken) {
        let mut flights = self.flights.lock();
        if let Some(flight) = flights.get_mut(key.as_str()) {
            flight.pending -= 1;
            flight.active = Some(cancel.clone());
        }
    }

    fn leave_flight(&self, key: &SessionKey) {
        let mut flights = self.flights.lock();
        if let Some(flight) = flights.get_mut(key.as_str()) {
            flight.active = None;
            if flight.pending == 0 {
                flights.remove(key.as_str());
            }
        }
    }

    async fn run_locked(&self, key: &SessionKey, params: &RunParams) -> Result<RunOutcome> {
        if params.cancel.is_cancelled() {
            return Err(anyhow::Error::new(Cancelled));
        }

        // 1. Directives.
        let (message, parsed) = if params.suppress_directives {
            (params.message.clone(), None)
        } else {
            let parsed = directives::parse_directives(&params.message);
            (parsed.cleaned_text.clone(), Some(parsed))
        };

        // 2–3. Workspace and daily memory.
        let workspace_dir = workspace::resolve_workspace(
            self.config.agent.workspace.as_deref(),
            self.runtime.profile(),
        )?;
        let mut context_files = workspace::ensure_workspace(&workspace_dir)?;
        if params.load_memory {
            let today = chrono::Local::now().date_naive();
            if let Some(memory) = workspace::load_daily_memory(&workspace_dir, today) {
                context_files.push(memory);
            }
        }

        // 4. Skills.
        let mut skill_dirs: Vec<PathBuf> = Vec::new();
        if let Some(bundled) = &self.bundled_skills_dir {
            skill_dirs.push(bundled.clone());
        }
        for extra in &self.config.skills.extra_dirs {
            skill_dirs.push(crate::util::expand_tilde(extra));
        }
        skill_dirs.push(self.runtime.managed_skills_dir());
        skill_dirs.push(workspace_dir.join("skills"));
        let discovered = skills::discover_skills(&skill_dirs);
        let active_skills = skills::filter_skills(
            discovered,
            &self.config.skills,
            std::env::consts::OS,
            &skills::bin_exists_on_path,
        );
        let skills_prompt = skills::skills_prompt(&active_skills);

        // 5. Env overrides; the guard restores on every exit path below.
        let _env_guard = skills::EnvGuard::apply(&active_skills, &self.config.skills).await;

        // 6. Session and model chain.
        let session = self.store.get_or_create(key)?;
        let chain =
            providers::resolve_model_chain(&self.config.agent, session.model_override.as_deref())?;

        let thinking = params
            .thinking_level
            .or_else(|| parsed.as_ref().and_then(|p| p.think_level))
            .or(session.thinking_level)
            .or_else(|| {
                self.config
                    .agent
                    .thinking
                    .as_deref()
                    .and_then(ThinkLevel::parse)
            })
            .unwrap_or(ThinkLevel::Medium);

        // 7. System prompt suffix.
        let tools = self.available_tools();
        let local_now = chrono::Local::now();
        let suffix = prompt::build_system_suffix(&prompt::PromptContext {
            tools: &tools,
            denied_tools: &self.config.agent.tool_filter.deny,
            workspace_dir: &workspace_dir,
            timezone: &std::env::var("TZ").unwrap_or_else(|_| "local".to_string()),
            local_time: local_now.format("%Y-%m-%d %H:%M:%S %z").to_string(),
            default_thinking: thinking,
        });

        // 8. Transcript.
        let transcript = Transcript::open(&self.runtime.sessions_dir(&self.agent_id), &session.id)?;
        transcript.append_user(&message)?;

        // 9–10. Invoke with fallback discipline.
        let events = params
            .events
            .clone()
            .unwrap_or_else(|| mpsc::unbounded_channel().0);
        let (outcome, model) = self
            .invoke_with_fallback(
                &chain,
                &session.id,
                &message,
                &context_files,
                skills_prompt.as_deref(),
                &suffix,
                thinking,
                events,
                &params.cancel,
            )
            .await?;

        // 11. Persist usage and model; aborted turns never reach this point.
        transcript.append_assistant(&outcome.text, Some(&model.to_string()), outcome.usage)?;
        let session = self.store.update(
            key,
            SessionPatch {
                tokens: outcome.usage,
                last_model: Some((model.provider.clone(), model.id.clone())),
                thinking_level: parsed.as_ref().and_then(|p| p.think_level),
                verbose_level: parsed.as_ref().and_then(|p| p.verbose_level),
                ..SessionPatch::default()
            },
        )?;

        Ok(RunOutcome {
            response: outcome.text,
            session_id: session.id,
            session_key: key.clone(),
            usage: outcome.usage,
            model: Some(model),
            directives: parsed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke_with_fallback(
        &self,
        chain: &[ModelRef],
        session_id: &str,
        message: &str,
        context_files: &[ContextFile],
        skills_prompt: Option<&str>,
        system_suffix: &str,
        thinking: ThinkLevel,
        events: mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<(TurnOutcome, ModelRef)> {
        let timeout_secs = self.config.agent.model.timeout_seconds;
        let mut attempts: Vec<FallbackAttempt> = Vec::new();

        for candidate in chain {
            let request = TurnRequest {
                model: candidate.clone(),
                session_id: session_id.to_string(),
                message: message.to_string(),
                context_files: context_files.to_vec(),
                skills_prompt: skills_prompt.map(str::to_string),
                system_prompt_suffix: system_suffix.to_string(),
                thinking_level: thinking,
            };

            let call = self.backend.run_turn(request, events.clone(), cancel.clone());
            let result = if timeout_secs > 0 {
                match tokio::time::timeout(Duration::from_secs(timeout_secs), call).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("model call timed out after {timeout_secs}s")),
                }
            } else {
                call.await
            };

            match result {
                Ok(outcome) => {
                    if !attempts.is_empty() {
                        tracing::info!(
                            model = %candidate,
                            failed_attempts = attempts.len(),
                            "Model fallback recovered"
                        );
                    }
                    return Ok((outcome, candidate.clone()));
                }
                Err(err) => {
                    if providers::is_cancellation(&err) || cancel.is_cancelled() {
                        return Err(anyhow::Error::new(Cancelled));
                    }
                    tracing::warn!(model = %candidate, "Model call failed: {err:#}");
                    attempts.push(FallbackAttempt {
                        provider: candidate.provider.clone(),
                        model: candidate.id.clone(),
                        error: format!("{err:#}"),
                    });
                }
            }
        }

        Err(anyhow::Error::new(FallbackError { attempts }))
    }

    fn available_tools(&self) -> Vec<String> {
        if self.config.agent.tool_filter.allow.is_empty() {
            ["read", "write", "edit", "grep", "find", "ls", "bash", "process"]
                .iter()
                .map(|s| (*s).to_string())
                .collect()
        } else {
            self.config.agent.tool_filter.allow.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that records concurrency and can fail per model.
    struct StubBackend {
        fail_models: Vec<String>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl StubBackend {
        fn ok() -> Self {
            Self {
                fail_models: Vec::new(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
            }
        }

        fn failing(models: &[&str]) -> Self {
            Self {
                fail_models: models.iter().map(|s| (*s).to_string()).collect(),
                ..Self::ok()
            }
        }
    }

    #[async_trait]
    impl ModelBackend for StubBackend {
        async fn run_turn(
            &self,
            request: TurnRequest,
            events: mpsc::UnboundedSender<AgentEvent>,
            cancel: CancellationToken,
        ) -> Result<TurnOutcome> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let result = async {
                if cancel.is_cancelled() {
                    return Err(anyhow::Error::new(Cancelled));
                }
                if !self.delay.is_zero() {
                    tokio::select! {
                        () = tokio::time::sleep(self.delay) => {}
                        () = cancel.cancelled() => return Err(anyhow::Error::new(Cancelled)),
                    }
                }
                if self.fail_models.contains(&request.model.to_string()) {
                    anyhow::bail!("backend unavailable");
                }
                let text = format!("echo: {}", request.message);
                let _ = events.send(AgentEvent::TextChunk { text: text.clone() });
                let _ = events.send(AgentEvent::Final { text: text.clone() });
                Ok(TurnOutcome {
                    text,
                    usage: Some(TokenTotals {
                        input: 10,
                        output: 4,
                        total: 14,
                    }),
                })
            }
            .await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn runner_with(backend: StubBackend, tmp: &tempfile::TempDir) -> (AgentRunner, Arc<StubBackend>) {
        let runtime = Runtime::rooted_at(tmp.path());
        let mut config = Config::default();
        config.agent.workspace = Some(tmp.path().join("ws").to_string_lossy().into_owned());
        let backend = Arc::new(backend);
        let store = Arc::new(SessionStore::open(&tmp.path().join("sessions")));
        let runner = AgentRunner::new(
            runtime,
            Arc::new(config),
            store,
            backend.clone(),
            "main",
        );
        (runner, backend)
    }

    #[tokio::test]
    async fn run_returns_response_and_persists_usage() {
        let tmp = tempfile::tempdir().unwrap();
        let (runner, _) = runner_with(StubBackend::ok(), &tmp);

        let outcome = runner.run(RunParams::new("hello")).await.unwrap();
        assert_eq!(outcome.response, "echo: hello");
        assert_eq!(outcome.model.unwrap().to_string(), providers::DEFAULT_MODEL);

        let session = runner.store().get(&outcome.session_key).unwrap();
        assert_eq!(session.tokens.total, 14);
        assert_eq!(session.last_provider.as_deref(), Some("anthropic"));
    }

    #[tokio::test]
    async fn directives_are_stripped_before_the_backend_sees_text() {
        let tmp = tempfile::tempdir().unwrap();
        let (runner, _) = runner_with(StubBackend::ok(), &tmp);

        let outcome = runner
            .run(RunParams::new("/think high draft a report"))
            .await
            .unwrap();
        assert_eq!(outcome.response, "echo: draft a report");
        let parsed = outcome.directives.unwrap();
        assert_eq!(parsed.think_level, Some(ThinkLevel::High));
    }

    #[tokio::test]
    async fn fallback_chain_records_failed_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = Runtime::rooted_at(tmp.path());
        let mut config = Config::default();
        config.agent.workspace = Some(tmp.path().join("ws").to_string_lossy().into_owned());
        config.agent.model.provider = Some("openai".into());
        config.agent.model.model = Some("gpt-x".into());
        config.agent.model.fallbacks = vec!["anthropic/claude-y".into(), "google/gemini-z".into()];
        let store = Arc::new(SessionStore::open(&tmp.path().join("sessions")));
        let runner = AgentRunner::new(
            runtime,
            Arc::new(config),
            store,
            Arc::new(StubBackend::failing(&["openai/gpt-x"])),
            "main",
        );

        let outcome = runner.run(RunParams::new("hi")).await.unwrap();
        assert_eq!(outcome.model.unwrap().to_string(), "anthropic/claude-y");
    }

    #[tokio::test]
    async fn exhausted_chain_surfaces_every_attempt() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = Runtime::rooted_at(tmp.path());
        let mut config = Config::default();
        config.agent.workspace = Some(tmp.path().join("ws").to_string_lossy().into_owned());
        config.agent.model.provider = Some("openai".into());
        config.agent.model.model = Some("gpt-x".into());
        config.agent.model.fallbacks = vec!["anthropic/claude-y".into()];
        let store = Arc::new(SessionStore::open(&tmp.path().join("sessions")));
        let runner = AgentRunner::new(
            runtime,
            Arc::new(config),
            store,
            Arc::new(StubBackend::failing(&["openai/gpt-x", "anthropic/claude-y"])),
            "main",
        );

        let err = runner.run(RunParams::new("hi")).await.unwrap_err();
        let fallback = err.downcast_ref::<FallbackError>().unwrap();
        assert_eq!(fallback.attempts.len(), 2);
        assert_eq!(fallback.attempts[0].provider, "openai");
        assert_eq!(fallback.attempts[1].provider, "anthropic");
    }

    #[tokio::test]
    async fn turns_for_one_key_are_single_flight() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = StubBackend {
            delay: Duration::from_millis(25),
            ..StubBackend::ok()
        };
        let (runner, backend) = runner_with(backend, &tmp);
        let runner = Arc::new(runner);

        let mut handles = Vec::new();
        for i in 0..4 {
            let runner = runner.clone();
            handles.push(tokio::spawn(async move {
                runner.run(RunParams::new(format!("msg {i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_turn_does_not_touch_counters() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = StubBackend {
            delay: Duration::from_millis(200),
            ..StubBackend::ok()
        };
        let (runner, _) = runner_with(backend, &tmp);
        let runner = Arc::new(runner);

        let mut params = RunParams::new("slow turn");
        let cancel = params.cancel.clone();
        let key = runner.main_session_key();
        params.session_key = Some(key.clone());

        let run = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(params).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let err = run.await.unwrap().unwrap_err();
        assert!(providers::is_cancellation(&err));

        let session = runner.store().get(&key).unwrap();
        assert_eq!(session.tokens.total, 0);
    }
}
