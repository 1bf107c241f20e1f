//! Streaming events emitted during an agent turn.
//!
//! One channel replaces the callback triple (`onTextChunk`, `onToolUse`,
//! `onToolResult`): consumers read the channel and ordering falls out of the
//! queue with no lock juggling.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Incremental assistant text.
    TextChunk { text: String },
    /// A tool execution started.
    ToolUse {
        name: String,
        args: serde_json::Value,
    },
    /// A tool execution finished.
    ToolResult { name: String, result: String },
    /// The assistant message completed; `text` is the accumulated final.
    Final { text: String },
}
