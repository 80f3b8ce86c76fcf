//! Per-session tracked state

use crate::AgentStatus;
use crate::tailer::FileTailer;
use crate::timers::SessionTimers;
use crate::transcript::labels::is_permission_exempt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Registry-assigned identifier of a tracked session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u32);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A tool call running inside a sub-agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentTool {
    pub name: String,
    pub status: String,
}

/// An in-flight top-level tool call.
///
/// Sub-agent tools live inside their parent, so they disappear together with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRecord {
    pub name: String,
    pub status: String,
    pub subagent_tools: BTreeMap<String, SubagentTool>,
}

impl ToolRecord {
    pub fn new(name: String, status: String) -> Self {
        Self {
            name,
            status,
            subagent_tools: BTreeMap::new(),
        }
    }

    fn has_non_exempt_subagent_tool(&self) -> bool {
        self.subagent_tools
            .values()
            .any(|t| !is_permission_exempt(&t.name))
    }
}

/// Session state tracked by the registry
#[derive(Debug)]
pub struct SessionState {
    pub(crate) agent_id: AgentId,
    pub(crate) session_key: String,
    pub(crate) project_label: String,
    pub(crate) tailer: FileTailer,
    /// Active top-level tools by tool-use id
    pub(crate) tools: BTreeMap<String, ToolRecord>,
    pub(crate) is_waiting_for_input: bool,
    /// Set once a permission-needed signal went out, until new data arrives
    pub(crate) permission_flag_sent: bool,
    /// Suppresses the idle-waiting timer while the turn used tools
    pub(crate) had_tool_call_this_turn: bool,
    pub(crate) status: AgentStatus,
    pub(crate) timers: SessionTimers,
}

impl SessionState {
    pub fn new(
        agent_id: AgentId,
        session_key: String,
        project_label: String,
        tailer: FileTailer,
    ) -> Self {
        Self {
            agent_id,
            session_key,
            project_label,
            tailer,
            tools: BTreeMap::new(),
            is_waiting_for_input: false,
            permission_flag_sent: false,
            had_tool_call_this_turn: false,
            status: AgentStatus::Idle,
            timers: SessionTimers::default(),
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn project_label(&self) -> &str {
        &self.project_label
    }

    pub fn tailer(&self) -> &FileTailer {
        &self.tailer
    }

    pub fn tools(&self) -> &BTreeMap<String, ToolRecord> {
        &self.tools
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn is_waiting_for_input(&self) -> bool {
        self.is_waiting_for_input
    }

    pub fn permission_flag_sent(&self) -> bool {
        self.permission_flag_sent
    }

    pub fn had_tool_call_this_turn(&self) -> bool {
        self.had_tool_call_this_turn
    }

    pub fn timers(&self) -> &SessionTimers {
        &self.timers
    }

    /// Any active top-level tool that is not permission-exempt
    pub(crate) fn has_non_exempt_tool(&self) -> bool {
        self.tools.values().any(|t| !is_permission_exempt(&t.name))
    }

    /// Any nested tool, under any parent, that is not permission-exempt
    pub(crate) fn has_non_exempt_subagent_tool(&self) -> bool {
        self.tools.values().any(ToolRecord::has_non_exempt_subagent_tool)
    }

    /// Parent tool ids whose sub-agent has a non-exempt tool in flight
    pub(crate) fn stuck_subagent_parents(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|(_, t)| t.has_non_exempt_subagent_tool())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop every tracked tool. Returns whether anything was tracked.
    pub(crate) fn clear_tools(&mut self) -> bool {
        let had_any = !self.tools.is_empty();
        self.tools.clear();
        had_any
    }
}
