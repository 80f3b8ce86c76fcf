//! Session state machine.
//!
//! Applies classified transcript records and timer expirations to a
//! [`SessionState`], pushing the resulting events into [`Effects`]. Nothing
//! here touches the filesystem or the clock; `now` arrives with the effects.

use crate::session::{SessionState, SubagentTool, ToolRecord};
use crate::timers::{DeferredQueue, TimerDelays, TimerKind};
use crate::transcript::labels::{format_tool_status, is_permission_exempt, is_subagent_tool};
use crate::transcript::{
    ContentBlock, ProgressData, SubagentRole, TranscriptRecord, UserContent, parse_line,
};
use crate::{AgentEvent, AgentStatus};
use std::time::Instant;
use tracing::{debug, trace};

/// Where state-machine output goes
pub struct Effects<'a> {
    pub now: Instant,
    pub delays: TimerDelays,
    pub events: &'a mut Vec<AgentEvent>,
    pub deferred: &'a mut DeferredQueue,
}

impl Effects<'_> {
    fn emit(&mut self, event: AgentEvent) {
        trace!(?event, "transcript event");
        self.events.push(event);
    }

    fn emit_after_tool_done_delay(&mut self, event: AgentEvent) {
        self.deferred.push(self.now + self.delays.tool_done, event);
    }
}

impl SessionState {
    /// Process a batch of complete lines from one read.
    ///
    /// Any new data cancels both pending timers and clears an outstanding
    /// permission signal before the records themselves are applied.
    pub fn apply_lines(&mut self, lines: &[String], fx: &mut Effects<'_>) {
        if lines.iter().all(|l| l.trim().is_empty()) {
            return;
        }

        self.timers.cancel_all();
        if self.permission_flag_sent {
            self.permission_flag_sent = false;
            fx.emit(AgentEvent::PermissionCleared {
                agent_id: self.agent_id,
            });
        }

        for line in lines {
            if let Some(record) = parse_line(line) {
                self.apply_record(&record, fx);
            }
        }
    }

    pub fn apply_record(&mut self, record: &TranscriptRecord, fx: &mut Effects<'_>) {
        match record {
            TranscriptRecord::Assistant {
                rate_limited: true, ..
            } => self.on_rate_limited(fx),
            TranscriptRecord::Assistant { blocks, .. } => self.on_assistant(blocks, fx),
            TranscriptRecord::User { content } => self.on_user(content, fx),
            TranscriptRecord::System { subtype } if subtype.as_deref() == Some("turn_duration") => {
                self.on_turn_end(fx)
            }
            TranscriptRecord::Progress {
                parent_tool_id: Some(parent),
                data,
            } => self.on_progress(parent, data, fx),
            TranscriptRecord::System { .. }
            | TranscriptRecord::Progress { .. }
            | TranscriptRecord::Unrecognized => {}
        }
    }

    /// Handle an expired timer. State may have moved on since it was
    /// scheduled, so everything is re-derived here.
    pub fn on_timer(&mut self, kind: TimerKind, fx: &mut Effects<'_>) {
        match kind {
            TimerKind::Waiting => {
                debug!(agent_id = %self.agent_id, "text idle; waiting for input");
                self.is_waiting_for_input = true;
                self.set_status(AgentStatus::Waiting, fx);
            }
            TimerKind::Permission => {
                if self.permission_flag_sent {
                    return;
                }
                let top_level = self.has_non_exempt_tool();
                let stuck_parents = self.stuck_subagent_parents();
                if !top_level && stuck_parents.is_empty() {
                    return;
                }

                debug!(agent_id = %self.agent_id, "tool appears blocked on permission");
                self.permission_flag_sent = true;
                fx.emit(AgentEvent::PermissionNeeded {
                    agent_id: self.agent_id,
                    parent_tool_id: None,
                });
                for parent_tool_id in stuck_parents {
                    fx.emit(AgentEvent::PermissionNeeded {
                        agent_id: self.agent_id,
                        parent_tool_id: Some(parent_tool_id),
                    });
                }
            }
        }
    }

    fn set_status(&mut self, status: AgentStatus, fx: &mut Effects<'_>) {
        self.status = status;
        fx.emit(AgentEvent::StatusChanged {
            agent_id: self.agent_id,
            status,
        });
    }

    fn start_timer(&mut self, kind: TimerKind, fx: &Effects<'_>) {
        let delay = match kind {
            TimerKind::Waiting => fx.delays.text_idle,
            TimerKind::Permission => fx.delays.permission,
        };
        self.timers.start(kind, fx.now + delay);
    }

    fn emit_tools_cleared(&mut self, fx: &mut Effects<'_>) {
        fx.emit(AgentEvent::ToolsCleared {
            agent_id: self.agent_id,
        });
    }

    fn on_rate_limited(&mut self, fx: &mut Effects<'_>) {
        debug!(agent_id = %self.agent_id, "rate limited");
        self.timers.cancel_all();
        self.clear_tools();
        self.is_waiting_for_input = false;
        self.permission_flag_sent = false;
        self.had_tool_call_this_turn = false;
        self.emit_tools_cleared(fx);
        self.set_status(AgentStatus::RateLimited, fx);
    }

    fn on_assistant(&mut self, blocks: &[ContentBlock], fx: &mut Effects<'_>) {
        let has_tool_use = blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }));

        if !has_tool_use {
            if blocks.iter().any(|b| matches!(b, ContentBlock::Text)) && !self.had_tool_call_this_turn
            {
                self.start_timer(TimerKind::Waiting, fx);
            }
            return;
        }

        self.timers.cancel(TimerKind::Waiting);
        self.is_waiting_for_input = false;
        self.had_tool_call_this_turn = true;
        self.set_status(AgentStatus::Active, fx);

        let mut has_non_exempt = false;
        for block in blocks {
            let ContentBlock::ToolUse {
                id: Some(id),
                name,
                input,
            } = block
            else {
                continue;
            };
            if self.tools.contains_key(id) {
                continue;
            }

            let status = format_tool_status(name, input);
            if !is_permission_exempt(name) {
                has_non_exempt = true;
            }
            self.tools
                .insert(id.clone(), ToolRecord::new(name.clone(), status.clone()));
            fx.emit(AgentEvent::ToolStarted {
                agent_id: self.agent_id,
                tool_id: id.clone(),
                tool_name: name.clone(),
                status,
            });
        }

        if has_non_exempt {
            self.start_timer(TimerKind::Permission, fx);
        }
    }

    fn on_user(&mut self, content: &UserContent, fx: &mut Effects<'_>) {
        match content {
            UserContent::Blocks(blocks) if content.has_tool_result() => {
                self.complete_tools(blocks, fx)
            }
            UserContent::Blocks(_) => self.on_user_prompt(fx),
            UserContent::Text(text) if !text.trim().is_empty() => self.on_user_prompt(fx),
            UserContent::Text(_) | UserContent::Missing => {}
        }
    }

    fn complete_tools(&mut self, blocks: &[ContentBlock], fx: &mut Effects<'_>) {
        for block in blocks {
            let ContentBlock::ToolResult {
                tool_use_id: Some(tool_id),
            } = block
            else {
                continue;
            };
            let Some(record) = self.tools.remove(tool_id) else {
                continue;
            };

            if is_subagent_tool(&record.name) {
                fx.emit(AgentEvent::SubagentCleared {
                    agent_id: self.agent_id,
                    parent_tool_id: tool_id.clone(),
                });
            }
            fx.emit_after_tool_done_delay(AgentEvent::ToolDone {
                agent_id: self.agent_id,
                tool_id: tool_id.clone(),
            });
        }

        if self.tools.is_empty() {
            self.had_tool_call_this_turn = false;
        }
    }

    /// A plain user message: the turn ended, and any inferred stuck state was wrong.
    fn on_user_prompt(&mut self, fx: &mut Effects<'_>) {
        self.timers.cancel_all();
        self.clear_tools();
        self.is_waiting_for_input = false;
        self.permission_flag_sent = false;
        self.had_tool_call_this_turn = false;
        self.emit_tools_cleared(fx);
        self.set_status(AgentStatus::Active, fx);
    }

    fn on_turn_end(&mut self, fx: &mut Effects<'_>) {
        self.timers.cancel_all();
        if self.clear_tools() {
            self.emit_tools_cleared(fx);
        }
        self.is_waiting_for_input = true;
        self.permission_flag_sent = false;
        self.had_tool_call_this_turn = false;
        self.set_status(AgentStatus::Waiting, fx);
    }

    fn on_progress(&mut self, parent: &str, data: &ProgressData, fx: &mut Effects<'_>) {
        match data {
            ProgressData::Liveness => {
                if self.tools.contains_key(parent) {
                    self.start_timer(TimerKind::Permission, fx);
                }
            }
            ProgressData::Subagent { role, blocks } => {
                let agent_id = self.agent_id;
                let Some(record) = self.tools.get_mut(parent) else {
                    return;
                };
                if !is_subagent_tool(&record.name) {
                    return;
                }

                let restart_permission = match role {
                    SubagentRole::Assistant => {
                        let mut has_non_exempt = false;
                        for block in blocks {
                            let ContentBlock::ToolUse {
                                id: Some(id),
                                name,
                                input,
                            } = block
                            else {
                                continue;
                            };
                            if record.subagent_tools.contains_key(id) {
                                continue;
                            }
                            let status = format_tool_status(name, input);
                            if !is_permission_exempt(name) {
                                has_non_exempt = true;
                            }
                            record.subagent_tools.insert(
                                id.clone(),
                                SubagentTool {
                                    name: name.clone(),
                                    status: status.clone(),
                                },
                            );
                            fx.emit(AgentEvent::SubagentToolStarted {
                                agent_id,
                                parent_tool_id: parent.to_string(),
                                tool_id: id.clone(),
                                tool_name: name.clone(),
                                status,
                            });
                        }
                        has_non_exempt
                    }
                    SubagentRole::User => {
                        for block in blocks {
                            let ContentBlock::ToolResult {
                                tool_use_id: Some(id),
                            } = block
                            else {
                                continue;
                            };
                            if record.subagent_tools.remove(id).is_some() {
                                fx.emit_after_tool_done_delay(AgentEvent::SubagentToolDone {
                                    agent_id,
                                    parent_tool_id: parent.to_string(),
                                    tool_id: id.clone(),
                                });
                            }
                        }
                        self.has_non_exempt_subagent_tool()
                    }
                };

                if restart_permission {
                    self.start_timer(TimerKind::Permission, fx);
                }
            }
            ProgressData::Other => {}
        }
    }
}
