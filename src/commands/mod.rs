//! Chat command router.
//!
//! Inbound text is normalized (trim, collapse whitespace, lowercase, one
//! leading `/` stripped) and matched against registered commands in
//! registration order — first alias match wins. A match evaluates the
//! command's policy before running the handler; unauthorized requesters get
//! the pairing reply.

use crate::channels::ChannelMessage;
use crate::pairing::{pairing_reply, PairingStore};
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandPolicy {
    /// Whether the command may run from a group chat.
    pub allow_in_group: bool,
    /// Whether the requester must be on the pairing allow-list.
    pub requires_auth: bool,
    /// Whether the command only applies to the main session.
    pub require_main_session: bool,
}

#[derive(Debug, Clone)]
pub struct CommandContext {
    pub provider: String,
    pub peer: String,
    /// Argument tail after the matched alias (normalized, trimmed).
    pub args: String,
    pub is_group: bool,
    pub is_main_session: bool,
    pub authorized: bool,
}

/// What the router tells the admission pipeline to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Send this text back, stop processing.
    Reply(String),
    /// Stop processing without replying.
    Silent,
    /// Not handled here; continue to the agent.
    PassThrough,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: CommandContext) -> Result<CommandOutcome>;
}

/// Adapter so closures can serve as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(CommandContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CommandOutcome>> + Send,
{
    async fn handle(&self, ctx: CommandContext) -> Result<CommandOutcome> {
        (self.0)(ctx).await
    }
}

pub struct Command {
    pub canonical_name: String,
    pub text_aliases: Vec<String>,
    pub accepts_args: bool,
    pub policy: CommandPolicy,
    pub handler: Arc<dyn CommandHandler>,
}

impl Command {
    pub fn new(
        canonical_name: impl Into<String>,
        text_aliases: &[&str],
        accepts_args: bool,
        policy: CommandPolicy,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            canonical_name: canonical_name.into(),
            text_aliases: text_aliases.iter().map(|s| (*s).to_string()).collect(),
            accepts_args,
            policy,
            handler,
        }
    }
}

pub struct CommandRouter {
    commands: Vec<Command>,
    pairing: Arc<PairingStore>,
}

impl CommandRouter {
    pub fn new(pairing: Arc<PairingStore>) -> Self {
        Self {
            commands: Vec::new(),
            pairing,
        }
    }

    pub fn register(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Route one inbound message. `PassThrough` means "not a command (or a
    /// command that chose not to consume it) — keep going to the agent".
    pub async fn route(&self, message: &ChannelMessage, is_main_session: bool) -> CommandOutcome {
        let normalized = normalize_command_text(&message.content);
        if normalized.is_empty() {
            return CommandOutcome::PassThrough;
        }

        for command in &self.commands {
            for alias in &command.text_aliases {
                let Some(args) = match_alias(&normalized, alias, command.accepts_args) else {
                    continue;
                };

                if message.is_group && !command.policy.allow_in_group {
                    // Group chats treat gated commands as ordinary text.
                    return CommandOutcome::PassThrough;
                }

                let authorized = self.pairing.is_allowed(&message.provider, &message.peer);
                if command.policy.requires_auth && !authorized {
                    return self.unauthorized_reply(message);
                }
                if command.policy.require_main_session && !is_main_session {
                    return CommandOutcome::Reply(format!(
                        "{} is only available in the main session.",
                        command.canonical_name
                    ));
                }

                let ctx = CommandContext {
                    provider: message.provider.clone(),
                    peer: message.peer.clone(),
                    args,
                    is_group: message.is_group,
                    is_main_session,
                    authorized,
                };
                return match command.handler.handle(ctx).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::warn!(
                            command = %command.canonical_name,
                            "Command handler failed: {err:#}"
                        );
                        CommandOutcome::Reply(format!("{err:#}"))
                    }
                };
            }
        }
        CommandOutcome::PassThrough
    }

    fn unauthorized_reply(&self, message: &ChannelMessage) -> CommandOutcome {
        let id_line = format!("Your {} id: {}", message.provider, message.peer);
        match self.pairing.begin_pairing(&message.provider, &message.peer) {
            Ok(code) => {
                CommandOutcome::Reply(pairing_reply(&id_line, &message.provider, &code))
            }
            Err(err) => {
                tracing::warn!("Failed to issue pairing code: {err:#}");
                CommandOutcome::Silent
            }
        }
    }
}

/// Trim, collapse whitespace, lowercase, strip a single leading `/`.
fn normalize_command_text(text: &str) -> String {
    let collapsed = crate::util::collapse_whitespace(text).to_lowercase();
    match collapsed.strip_prefix('/') {
        Some(rest) => rest.to_string(),
        None => collapsed,
    }
}

/// Literal alias match against the normalized prefix. Without
/// `accepts_args`, trailing tokens disqualify the match. Returns the
/// argument tail on success.
fn match_alias(normalized: &str, alias: &str, accepts_args: bool) -> Option<String> {
    if normalized == alias {
        return Some(String::new());
    }
    if accepts_args {
        if let Some(rest) = normalized.strip_prefix(alias) {
            if rest.starts_with(' ') {
                return Some(rest.trim().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str) -> ChannelMessage {
        ChannelMessage {
            provider: "whatsapp".into(),
            peer: "+15555550123".into(),
            message_id: Some("m1".into()),
            reply_to: "+15555550123".into(),
            content: content.into(),
            is_group: false,
            timestamp_ms: 0,
        }
    }

    fn echo_handler() -> Arc<dyn CommandHandler> {
        Arc::new(FnHandler(|ctx: CommandContext| async move {
            Ok(CommandOutcome::Reply(format!("args: {}", ctx.args)))
        }))
    }

    fn router_with(commands: Vec<Command>, tmp: &tempfile::TempDir) -> CommandRouter {
        let pairing = Arc::new(PairingStore::open(&tmp.path().join("pairing.json")));
        let mut router = CommandRouter::new(pairing);
        for command in commands {
            router.register(command);
        }
        router
    }

    #[tokio::test]
    async fn plain_text_passes_through() {
        let tmp = tempfile::tempdir().unwrap();
        let router = router_with(
            vec![Command::new(
                "status",
                &["status"],
                false,
                CommandPolicy::default(),
                echo_handler(),
            )],
            &tmp,
        );

        let outcome = router.route(&message("how are you"), true).await;
        assert_eq!(outcome, CommandOutcome::PassThrough);
    }

    #[tokio::test]
    async fn alias_matches_with_and_without_slash() {
        let tmp = tempfile::tempdir().unwrap();
        let router = router_with(
            vec![Command::new(
                "status",
                &["status"],
                false,
                CommandPolicy::default(),
                echo_handler(),
            )],
            &tmp,
        );

        assert_eq!(
            router.route(&message("/status"), true).await,
            CommandOutcome::Reply("args: ".into())
        );
        assert_eq!(
            router.route(&message("  STATUS  "), true).await,
            CommandOutcome::Reply("args: ".into())
        );
    }

    #[tokio::test]
    async fn no_arg_command_rejects_trailing_tokens() {
        let tmp = tempfile::tempdir().unwrap();
        let router = router_with(
            vec![Command::new(
                "status",
                &["status"],
                false,
                CommandPolicy::default(),
                echo_handler(),
            )],
            &tmp,
        );

        let outcome = router.route(&message("status report please"), true).await;
        assert_eq!(outcome, CommandOutcome::PassThrough);
    }

    #[tokio::test]
    async fn arg_command_receives_the_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let router = router_with(
            vec![Command::new(
                "pairing",
                &["pairing"],
                true,
                CommandPolicy::default(),
                echo_handler(),
            )],
            &tmp,
        );

        let outcome = router
            .route(&message("/pairing approve whatsapp abc123"), true)
            .await;
        assert_eq!(
            outcome,
            CommandOutcome::Reply("args: approve whatsapp abc123".into())
        );
    }

    #[tokio::test]
    async fn first_registered_alias_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let first = Arc::new(FnHandler(|_ctx: CommandContext| async {
            Ok(CommandOutcome::Reply("first".into()))
        }));
        let second = Arc::new(FnHandler(|_ctx: CommandContext| async {
            Ok(CommandOutcome::Reply("second".into()))
        }));
        let router = router_with(
            vec![
                Command::new("one", &["go"], false, CommandPolicy::default(), first),
                Command::new("two", &["go"], false, CommandPolicy::default(), second),
            ],
            &tmp,
        );

        assert_eq!(
            router.route(&message("go"), true).await,
            CommandOutcome::Reply("first".into())
        );
    }

    #[tokio::test]
    async fn unauthorized_requester_gets_pairing_reply() {
        let tmp = tempfile::tempdir().unwrap();
        let router = router_with(
            vec![Command::new(
                "reset",
                &["new"],
                false,
                CommandPolicy {
                    requires_auth: true,
                    ..CommandPolicy::default()
                },
                echo_handler(),
            )],
            &tmp,
        );

        let CommandOutcome::Reply(reply) = router.route(&message("new"), true).await else {
            panic!("expected a reply");
        };
        assert!(reply.starts_with("Clawdbot: access not configured."));
        assert!(reply.contains("Pairing code: "));
        assert!(reply.contains("clawdbot pairing approve whatsapp "));
    }

    #[tokio::test]
    async fn authorized_requester_runs_gated_command() {
        let tmp = tempfile::tempdir().unwrap();
        let pairing = Arc::new(PairingStore::open(&tmp.path().join("pairing.json")));
        let code = pairing.begin_pairing("whatsapp", "+15555550123").unwrap();
        pairing.approve("whatsapp", &code).unwrap();

        let mut router = CommandRouter::new(pairing);
        router.register(Command::new(
            "reset",
            &["new"],
            false,
            CommandPolicy {
                requires_auth: true,
                ..CommandPolicy::default()
            },
            echo_handler(),
        ));

        assert_eq!(
            router.route(&message("new"), true).await,
            CommandOutcome::Reply("args: ".into())
        );
    }

    #[tokio::test]
    async fn group_chats_skip_gated_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let router = router_with(
            vec![Command::new(
                "status",
                &["status"],
                false,
                CommandPolicy::default(),
                echo_handler(),
            )],
            &tmp,
        );

        let mut msg = message("status");
        msg.is_group = true;
        assert_eq!(router.route(&msg, true).await, CommandOutcome::PassThrough);
    }
}
