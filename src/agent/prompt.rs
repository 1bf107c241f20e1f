//! System-prompt suffix: the runtime facts appended after the context files.

use crate::directives::ThinkLevel;
use std::path::Path;

/// Canonical tool listing order; extras sort alphabetically after these.
const CANONICAL_TOOL_ORDER: [&str; 8] =
    ["read", "write", "edit", "grep", "find", "ls", "bash", "process"];

pub struct PromptContext<'a> {
    pub tools: &'a [String],
    pub denied_tools: &'a [String],
    pub workspace_dir: &'a Path,
    pub timezone: &'a str,
    pub local_time: String,
    pub default_thinking: ThinkLevel,
}

/// Order tool names canonically: the well-known eight first (in their fixed
/// order), then everything else alphabetically.
pub fn order_tools(tools: &[String]) -> Vec<String> {
    let mut ordered = Vec::with_capacity(tools.len());
    for canonical in CANONICAL_TOOL_ORDER {
        if tools.iter().any(|t| t == canonical) {
            ordered.push(canonical.to_string());
        }
    }
    let mut extras: Vec<String> = tools
        .iter()
        .filter(|t| !CANONICAL_TOOL_ORDER.contains(&t.as_str()))
        .cloned()
        .collect();
    extras.sort();
    ordered.extend(extras);
    ordered
}

pub fn build_system_suffix(ctx: &PromptContext<'_>) -> String {
    let mut suffix = String::new();

    let ordered = order_tools(ctx.tools);
    suffix.push_str("## Tooling\n");
    suffix.push_str(&format!("Available tools: {}\n", ordered.join(", ")));
    if !ctx.denied_tools.is_empty() {
        let mut denied = ctx.denied_tools.to_vec();
        denied.sort();
        suffix.push_str(&format!(
            "Do not call these tools: {}\n",
            denied.join(", ")
        ));
    }

    suffix.push_str("\n## Environment\n");
    suffix.push_str(&format!("Workspace: {}\n", ctx.workspace_dir.display()));
    suffix.push_str(&format!(
        "User timezone: {} (local time {})\n",
        ctx.timezone, ctx.local_time
    ));
    suffix.push_str(&format!(
        "Host: {} ({} {}, rust/tokio)\n",
        hostname(),
        std::env::consts::OS,
        std::env::consts::ARCH
    ));
    suffix.push_str(&format!(
        "Default thinking level: {}\n",
        ctx.default_thinking.as_str()
    ));
    suffix
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn tools_follow_canonical_order_with_alphabetical_extras() {
        let tools: Vec<String> = ["zeta", "bash", "read", "alpha", "ls"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        assert_eq!(order_tools(&tools), vec!["read", "ls", "bash", "alpha", "zeta"]);
    }

    #[test]
    fn suffix_lists_denied_tools_separately() {
        let tools: Vec<String> = vec!["read".into(), "bash".into()];
        let denied: Vec<String> = vec!["process".into()];
        let workspace = PathBuf::from("/home/user/clawd");
        let suffix = build_system_suffix(&PromptContext {
            tools: &tools,
            denied_tools: &denied,
            workspace_dir: &workspace,
            timezone: "Europe/Berlin",
            local_time: "2026-08-02 10:00".into(),
            default_thinking: ThinkLevel::Medium,
        });

        assert!(suffix.contains("Available tools: read, bash"));
        assert!(suffix.contains("Do not call these tools: process"));
        assert!(suffix.contains("Workspace: /home/user/clawd"));
        assert!(suffix.contains("Europe/Berlin"));
        assert!(suffix.contains("Default thinking level: medium"));
    }
}
