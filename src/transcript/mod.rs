//! Transcript record classification.
//!
//! Each JSONL line is parsed into a [`TranscriptRecord`]. Only the shape of a
//! record matters here: which `type` it has, which content blocks it carries,
//! and the tool identifiers inside them. Anything that does not match a known
//! shape becomes [`TranscriptRecord::Unrecognized`] and is ignored downstream.

pub mod labels;

use serde_json::Value;
use tracing::trace;

/// One content block of an assistant or user message
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    ToolUse {
        id: Option<String>,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: Option<String>,
    },
    Text,
    Other,
}

impl ContentBlock {
    fn from_value(value: &Value) -> Self {
        match str_field(value, "type") {
            Some("tool_use") => Self::ToolUse {
                id: str_field(value, "id").map(String::from),
                name: str_field(value, "name").unwrap_or_default().to_string(),
                input: value.get("input").cloned().unwrap_or(Value::Null),
            },
            Some("tool_result") => Self::ToolResult {
                tool_use_id: str_field(value, "tool_use_id").map(String::from),
            },
            Some("text") => Self::Text,
            _ => Self::Other,
        }
    }
}

/// Content of a `user` record
#[derive(Debug, Clone, PartialEq)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
    Missing,
}

impl UserContent {
    /// True when the user record carries at least one `tool_result` block.
    pub fn has_tool_result(&self) -> bool {
        matches!(self, Self::Blocks(blocks) if blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult { .. })))
    }
}

/// Which side of a sub-agent conversation a progress message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentRole {
    Assistant,
    User,
}

/// Payload of a `progress` record
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressData {
    /// `bash_progress` / `mcp_progress`: a long-running tool is still alive
    Liveness,
    /// A nested sub-agent message relayed under its parent tool
    Subagent {
        role: SubagentRole,
        blocks: Vec<ContentBlock>,
    },
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptRecord {
    Assistant {
        blocks: Vec<ContentBlock>,
        rate_limited: bool,
    },
    User {
        content: UserContent,
    },
    System {
        subtype: Option<String>,
    },
    Progress {
        parent_tool_id: Option<String>,
        data: ProgressData,
    },
    Unrecognized,
}

impl TranscriptRecord {
    /// Classify an already-parsed JSON record.
    pub fn from_value(value: &Value) -> Self {
        match str_field(value, "type") {
            Some("assistant") => Self::Assistant {
                blocks: message_blocks(value),
                rate_limited: is_rate_limit_error(value.get("error")),
            },
            Some("user") => {
                let content = match value.get("message").and_then(|m| m.get("content")) {
                    Some(Value::String(s)) => UserContent::Text(s.clone()),
                    Some(Value::Array(items)) => {
                        UserContent::Blocks(items.iter().map(ContentBlock::from_value).collect())
                    }
                    _ => UserContent::Missing,
                };
                Self::User { content }
            }
            Some("system") => Self::System {
                subtype: str_field(value, "subtype").map(String::from),
            },
            Some("progress") => Self::Progress {
                parent_tool_id: str_field(value, "parentToolUseID").map(String::from),
                data: progress_data(value.get("data").unwrap_or(&Value::Null)),
            },
            _ => Self::Unrecognized,
        }
    }
}

/// Parse one transcript line. Malformed lines are dropped, never surfaced.
pub fn parse_line(line: &str) -> Option<TranscriptRecord> {
    match serde_json::from_str::<Value>(line) {
        Ok(value) => Some(TranscriptRecord::from_value(&value)),
        Err(e) => {
            // Avoid logging the line itself (may contain user content).
            trace!(error = %e, "dropping malformed transcript line");
            None
        }
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

fn blocks_of(content: Option<&Value>) -> Vec<ContentBlock> {
    content
        .and_then(|c| c.as_array())
        .map(|items| items.iter().map(ContentBlock::from_value).collect())
        .unwrap_or_default()
}

fn message_blocks(record: &Value) -> Vec<ContentBlock> {
    blocks_of(record.get("message").and_then(|m| m.get("content")))
}

fn is_rate_limit_error(error: Option<&Value>) -> bool {
    match error {
        Some(Value::String(s)) => s.contains("rate_limit"),
        Some(obj @ Value::Object(_)) => {
            str_field(obj, "type").is_some_and(|t| t.contains("rate_limit"))
        }
        _ => false,
    }
}

fn progress_data(data: &Value) -> ProgressData {
    match str_field(data, "type") {
        Some("bash_progress" | "mcp_progress") => return ProgressData::Liveness,
        _ => {}
    }

    let Some(message) = data.get("message") else {
        return ProgressData::Other;
    };
    let role = match str_field(message, "type") {
        Some("assistant") => SubagentRole::Assistant,
        Some("user") => SubagentRole::User,
        _ => return ProgressData::Other,
    };
    match message.get("message").and_then(|m| m.get("content")) {
        Some(content @ Value::Array(_)) => ProgressData::Subagent {
            role,
            blocks: blocks_of(Some(content)),
        },
        _ => ProgressData::Other,
    }
}
