use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clawdbot::agent::{workspace, RunParams};
use clawdbot::cron::{CronJobPatch, RunNowOutcome, WakeMode};
use clawdbot::gateway::{Gateway, LogSink};
use clawdbot::providers::cli_backend::CliBackend;
use clawdbot::runtime::Runtime;
use clawdbot::session::SessionKey;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Agent CLI used as the model backend; must be on PATH and authenticated.
const MODEL_CLI: &str = "claude";

#[derive(Parser)]
#[command(name = "clawdbot", version, about = "Personal-assistant gateway")]
struct Cli {
    /// Config file path override.
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize the agent workspace and bootstrap files.
    Init {
        /// Workspace directory override.
        #[arg(short = 'd', long)]
        dir: Option<PathBuf>,
    },
    /// Interactive chat with the agent.
    Chat {
        /// Session key override.
        #[arg(short = 's', long)]
        session: Option<String>,
        /// Thinking level for each turn.
        #[arg(short = 't', long)]
        thinking: Option<String>,
    },
    /// One-shot agent turn.
    Agent {
        #[arg(short = 'm', long)]
        message: String,
        #[arg(short = 's', long)]
        session: Option<String>,
        #[arg(short = 't', long)]
        thinking: Option<String>,
        /// Emit the result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List sessions.
    Sessions,
    /// Reset a session to a fresh id.
    Reset {
        #[arg(short = 's', long)]
        session: Option<String>,
    },
    /// Scheduler management.
    Cron {
        #[command(subcommand)]
        action: CronAction,
    },
    /// Pairing management.
    Pairing {
        #[command(subcommand)]
        action: PairingAction,
    },
    /// Run the gateway daemon.
    Gateway,
}

#[derive(Subcommand)]
enum CronAction {
    Status,
    List {
        #[arg(long)]
        include_disabled: bool,
    },
    /// Add a job from a JSON5 object.
    Add {
        job: String,
    },
    /// Patch a job from a JSON5 object.
    Update {
        id: String,
        patch: String,
    },
    Remove {
        id: String,
    },
    /// Fire a job now (respects per-job single-flight).
    Run {
        id: String,
    },
    /// Forward a wake to the heartbeat driver.
    Wake {
        #[arg(long, default_value = "now")]
        mode: String,
        #[arg(long)]
        text: Option<String>,
    },
}

#[derive(Subcommand)]
enum PairingAction {
    /// Approve a pending pairing code.
    Approve { provider: String, code: String },
    /// List pending codes.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clawdbot=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut runtime = Runtime::from_env()?;
    if let Some(config_path) = cli.config {
        runtime = runtime.with_config_path(config_path);
    }
    let config = runtime.load_config()?;

    match cli.command {
        Commands::Init { dir } => {
            let workspace_dir = match dir {
                Some(dir) => dir,
                None => workspace::resolve_workspace(
                    config.agent.workspace.as_deref(),
                    runtime.profile(),
                )?,
            };
            workspace::ensure_workspace(&workspace_dir)?;
            println!("Workspace ready at {}", workspace_dir.display());
            Ok(())
        }
        Commands::Chat { session, thinking } => {
            let gateway = build_gateway(&runtime, &config)?;
            chat_loop(&gateway, session, thinking).await
        }
        Commands::Agent {
            message,
            session,
            thinking,
            json,
        } => {
            let gateway = build_gateway(&runtime, &config)?;
            let mut params = RunParams::new(message);
            params.session_key = session.map(SessionKey::raw);
            params.thinking_level = thinking
                .as_deref()
                .and_then(clawdbot::directives::ThinkLevel::parse);
            let outcome = gateway.admission().runner().run(params).await?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "response": outcome.response,
                        "sessionId": outcome.session_id,
                        "sessionKey": outcome.session_key.as_str(),
                        "model": outcome.model.map(|m| m.to_string()),
                        "usage": outcome.usage,
                    })
                );
            } else {
                println!("{}", outcome.response);
            }
            Ok(())
        }
        Commands::Sessions => {
            let gateway = build_gateway(&runtime, &config)?;
            let sessions = gateway.store().list();
            if sessions.is_empty() {
                println!("No sessions yet.");
                return Ok(());
            }
            for (key, session) in sessions {
                println!(
                    "{key} | id={} | tokens={} | updated={}",
                    &session.id[..8.min(session.id.len())],
                    session.tokens.total,
                    session.updated_at
                );
            }
            Ok(())
        }
        Commands::Reset { session } => {
            let gateway = build_gateway(&runtime, &config)?;
            let key = session
                .map(SessionKey::raw)
                .unwrap_or_else(|| gateway.admission().runner().main_session_key());
            let fresh = gateway.store().reset(&key)?;
            println!("Session {key} reset (new id {}).", fresh.id);
            Ok(())
        }
        Commands::Cron { action } => {
            let gateway = build_gateway(&runtime, &config)?;
            cron_command(&gateway, action).await
        }
        Commands::Pairing { action } => {
            let gateway = build_gateway(&runtime, &config)?;
            match action {
                PairingAction::Approve { provider, code } => {
                    match gateway.pairing().approve(&provider, &code)? {
                        Some(principal) => println!("Approved {principal} on {provider}."),
                        None => println!("Unknown or expired pairing code."),
                    }
                    Ok(())
                }
                PairingAction::List => {
                    let pending = gateway.pairing().pending();
                    if pending.is_empty() {
                        println!("No pending pairing codes.");
                    }
                    for entry in pending {
                        println!(
                            "{} | {} {} | expires {}",
                            entry.code, entry.provider, entry.principal, entry.expires_at_ms
                        );
                    }
                    Ok(())
                }
            }
        }
        Commands::Gateway => {
            let gateway = build_gateway(&runtime, &config)?;
            let cancel = CancellationToken::new();
            let run = tokio::spawn(gateway.run(cancel.clone()));
            tokio::signal::ctrl_c().await?;
            cancel.cancel();
            run.await??;
            Ok(())
        }
    }
}

fn build_gateway(
    runtime: &Runtime,
    config: &Arc<clawdbot::config::Config>,
) -> Result<Arc<Gateway>> {
    Gateway::build(
        runtime.clone(),
        (**config).clone(),
        Arc::new(CliBackend::new(MODEL_CLI)),
        Vec::new(),
        Arc::new(LogSink),
    )
}

async fn chat_loop(
    gateway: &Arc<Gateway>,
    session: Option<String>,
    thinking: Option<String>,
) -> Result<()> {
    let runner = gateway.admission().runner().clone();
    let key = session
        .map(SessionKey::raw)
        .unwrap_or_else(|| runner.main_session_key());
    let thinking = thinking
        .as_deref()
        .and_then(clawdbot::directives::ThinkLevel::parse);

    println!("Chatting on {key}. /quit to exit, /new to reset.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        match input {
            "/quit" | "/exit" => return Ok(()),
            "/new" | "/reset" => {
                gateway.store().reset(&key)?;
                println!("Fresh session.");
                continue;
            }
            _ => {}
        }

        let mut params = RunParams::new(input);
        params.session_key = Some(key.clone());
        params.thinking_level = thinking;
        match runner.run(params).await {
            Ok(outcome) => println!("{}", outcome.response),
            Err(err) => eprintln!("error: {err:#}"),
        }
    }
}

async fn cron_command(gateway: &Arc<Gateway>, action: CronAction) -> Result<()> {
    let cron = gateway.cron();
    match action {
        CronAction::Status => {
            let status = cron.status();
            println!(
                "Jobs: {} ({} enabled), next run at {:?}",
                status.jobs, status.enabled_jobs, status.next_run_at_ms
            );
        }
        CronAction::List { include_disabled } => {
            let jobs = cron.list(include_disabled);
            if jobs.is_empty() {
                println!("No cron jobs.");
            }
            for job in jobs {
                println!(
                    "{} | {} | enabled={} | next={:?} | last={:?}",
                    job.id,
                    job.name,
                    job.enabled,
                    job.state.next_run_at_ms,
                    job.state.last_status.map(|s| s.as_str()),
                );
            }
        }
        CronAction::Add { job } => {
            let raw: serde_json::Value = json5::from_str(&job).context("Invalid job JSON")?;
            let job = cron.add(&raw)?;
            println!("Added {} ({}), next run at {:?}", job.id, job.name, job.state.next_run_at_ms);
        }
        CronAction::Update { id, patch } => {
            let patch: CronJobPatch = json5::from_str(&patch).context("Invalid patch JSON")?;
            let job = cron.update(&id, patch)?;
            println!("Updated {} ({})", job.id, job.name);
        }
        CronAction::Remove { id } => {
            if cron.remove(&id)? {
                println!("Removed {id}");
            } else {
                println!("No such job: {id}");
            }
        }
        CronAction::Run { id } => match cron.run_now(&id).await? {
            RunNowOutcome::Started => println!("Job {id} ran."),
            RunNowOutcome::Skipped { reason } => println!("Skipped: {reason}"),
        },
        CronAction::Wake { mode, text } => {
            let mode = if mode.eq_ignore_ascii_case("now") {
                WakeMode::Now
            } else {
                WakeMode::NextHeartbeat
            };
            cron.wake(mode, text.as_deref(), Some("cli")).await?;
            println!("Wake forwarded.");
        }
    }
    Ok(())
}
