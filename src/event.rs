//! Events emitted to the UI sink
//!
//! One event per observable effect of transcript processing. The sink does
//! not need to know anything about the transcript format.

use crate::AgentId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Coarse status reported for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// No status reported yet
    #[default]
    Idle,
    /// Tools in flight, or a turn in progress
    Active,
    /// Turn finished, waiting for the user
    Waiting,
    /// Explicit rate-limit error seen
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A transcript is now being tailed
    SessionAttached {
        agent_id: AgentId,
        session_key: String,
        project_label: String,
        transcript_path: PathBuf,
    },
    /// A transcript is no longer tailed
    SessionDetached { agent_id: AgentId },
    StatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
    },
    ToolStarted {
        agent_id: AgentId,
        tool_id: String,
        tool_name: String,
        status: String,
    },
    ToolDone { agent_id: AgentId, tool_id: String },
    /// All top-level and sub-agent tools were dropped at once
    ToolsCleared { agent_id: AgentId },
    SubagentToolStarted {
        agent_id: AgentId,
        parent_tool_id: String,
        tool_id: String,
        tool_name: String,
        status: String,
    },
    SubagentToolDone {
        agent_id: AgentId,
        parent_tool_id: String,
        tool_id: String,
    },
    SubagentCleared {
        agent_id: AgentId,
        parent_tool_id: String,
    },
    /// A tool looks blocked on an approval prompt
    PermissionNeeded {
        agent_id: AgentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_id: Option<String>,
    },
    PermissionCleared { agent_id: AgentId },
}

impl AgentEvent {
    /// Get agent_id from any event
    pub fn agent_id(&self) -> AgentId {
        match self {
            Self::SessionAttached { agent_id, .. }
            | Self::SessionDetached { agent_id }
            | Self::StatusChanged { agent_id, .. }
            | Self::ToolStarted { agent_id, .. }
            | Self::ToolDone { agent_id, .. }
            | Self::ToolsCleared { agent_id }
            | Self::SubagentToolStarted { agent_id, .. }
            | Self::SubagentToolDone { agent_id, .. }
            | Self::SubagentCleared { agent_id, .. }
            | Self::PermissionNeeded { agent_id, .. }
            | Self::PermissionCleared { agent_id } => *agent_id,
        }
    }
}
