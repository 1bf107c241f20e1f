//! Subprocess model backend: drives the `claude` CLI in print mode.
//!
//! The real provider SDKs live outside this crate; this adapter makes the
//! binary usable end-to-end by shelling out to an agent CLI that is already
//! authenticated on the host. One invocation per turn.

use crate::agent::events::AgentEvent;
use crate::providers::{Cancelled, ModelBackend, TurnOutcome, TurnRequest};
use crate::session::TokenTotals;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct CliBackend {
    program: String,
}

impl CliBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Map `provider/model` ids onto the short names the CLI accepts.
    fn normalize_model(model_id: &str) -> String {
        let id = model_id.to_ascii_lowercase();
        for family in ["opus", "sonnet", "haiku"] {
            if id.contains(family) {
                return family.to_string();
            }
        }
        id
    }

    fn parse_output(stdout: &str) -> Result<(String, Option<TokenTotals>)> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            anyhow::bail!("Model CLI returned empty output");
        }
        let Ok(parsed) = serde_json::from_str::<Value>(trimmed) else {
            // Plain-text mode.
            return Ok((trimmed.to_string(), None));
        };
        let text = parsed
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Model CLI output had no 'result' field")?;
        let usage = parsed.get("usage").map(|usage| {
            let input = usage
                .get("input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let output = usage
                .get("output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            TokenTotals {
                input,
                output,
                total: input + output,
            }
        });
        Ok((text, usage))
    }
}

#[async_trait]
impl ModelBackend for CliBackend {
    async fn run_turn(
        &self,
        request: TurnRequest,
        events: mpsc::UnboundedSender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let mut system_prompt = String::new();
        for file in &request.context_files {
            system_prompt.push_str(&format!("## {}\n{}\n\n", file.name, file.content));
        }
        if let Some(skills) = &request.skills_prompt {
            system_prompt.push_str(skills);
            system_prompt.push('\n');
        }
        system_prompt.push_str(&request.system_prompt_suffix);

        let mut child = Command::new(&self.program)
            .arg("-p")
            .arg("--output-format")
            .arg("json")
            .arg("--model")
            .arg(Self::normalize_model(&request.model.id))
            .arg("--append-system-prompt")
            .arg(&system_prompt)
            .arg(&request.message)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn model CLI: {}", self.program))?;

        let mut stdout = child.stdout.take().context("Child stdout unavailable")?;
        let mut stderr = child.stderr.take().context("Child stderr unavailable")?;

        let output = async {
            let mut out = String::new();
            let mut err = String::new();
            stdout.read_to_string(&mut out).await?;
            stderr.read_to_string(&mut err).await?;
            let status = child.wait().await?;
            anyhow::Ok((status, out, err))
        };

        let (status, out, err) = tokio::select! {
            result = output => result?,
            () = cancel.cancelled() => {
                return Err(anyhow::Error::new(Cancelled));
            }
        };

        if !status.success() {
            anyhow::bail!(
                "Model CLI exited with {status}: {}",
                crate::util::truncate_with_ellipsis(err.trim(), 300)
            );
        }

        let (text, usage) = Self::parse_output(&out)?;
        let _ = events.send(AgentEvent::TextChunk { text: text.clone() });
        let _ = events.send(AgentEvent::Final { text: text.clone() });
        Ok(TurnOutcome { text, usage })
    }
}
