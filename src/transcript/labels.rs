//! Human-readable status labels for tool calls.

use serde_json::Value;

/// Maximum characters of a shell command shown in a status label
pub const BASH_COMMAND_MAX_CHARS: usize = 30;
/// Maximum characters of a sub-agent task description shown in a status label
pub const TASK_DESCRIPTION_MAX_CHARS: usize = 40;

const ELLIPSIS: char = '\u{2026}';

/// Tools that spawn a nested sub-agent whose activity arrives as `progress` records.
const SUBAGENT_TOOLS: &[&str] = &["Task", "Agent"];

/// Tools that legitimately run long or wait on the user; they never trigger
/// the permission heuristic on their own.
const PERMISSION_EXEMPT_TOOLS: &[&str] = &["Task", "Agent", "AskUserQuestion"];

pub fn is_subagent_tool(name: &str) -> bool {
    SUBAGENT_TOOLS.contains(&name)
}

pub fn is_permission_exempt(name: &str) -> bool {
    PERMISSION_EXEMPT_TOOLS.contains(&name)
}

/// Truncate a string to at most `max` characters (by Unicode char boundary).
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Truncate to `max` characters, appending an ellipsis when anything was cut.
fn truncate_with_ellipsis(s: &str, max: usize) -> String {
    let cut = truncate(s, max);
    if cut.len() < s.len() {
        format!("{cut}{ELLIPSIS}")
    } else {
        cut.to_string()
    }
}

/// Extract the final path component (filename), accepting either separator.
fn short_path(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn input_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(|v| v.as_str())
}

/// Status label for a tool call, derived from its name and input only.
pub fn format_tool_status(tool_name: &str, input: &Value) -> String {
    let file = || input_str(input, "file_path").map(short_path).unwrap_or("");

    match tool_name {
        "Read" => format!("Reading {}", file()),
        "Edit" => format!("Editing {}", file()),
        "Write" => format!("Writing {}", file()),
        "Bash" => {
            let command = input_str(input, "command").unwrap_or("");
            format!(
                "Running: {}",
                truncate_with_ellipsis(command, BASH_COMMAND_MAX_CHARS)
            )
        }
        "Glob" => "Searching files".to_string(),
        "Grep" => "Searching code".to_string(),
        "WebFetch" => "Fetching web content".to_string(),
        "WebSearch" => "Searching the web".to_string(),
        name if is_subagent_tool(name) => match input_str(input, "description") {
            Some(desc) if !desc.is_empty() => format!(
                "Subtask: {}",
                truncate_with_ellipsis(desc, TASK_DESCRIPTION_MAX_CHARS)
            ),
            _ => "Running subtask".to_string(),
        },
        "AskUserQuestion" => "Waiting for your answer".to_string(),
        "EnterPlanMode" => "Planning".to_string(),
        "NotebookEdit" => "Editing notebook".to_string(),
        other => format!("Using {other}"),
    }
}
