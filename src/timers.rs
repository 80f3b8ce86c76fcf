//! Timer heuristics.
//!
//! Timers are plain deadlines. The driver sleeps until the earliest one and
//! hands expirations back to the registry, so a firing timer is just another
//! input on the single processing path. `now` is always supplied by the
//! caller, which keeps every timer effect replayable in tests.

use crate::{AgentEvent, AgentId};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Fixed delays used by the heuristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDelays {
    /// Assistant text with no tool call → waiting for input
    pub text_idle: Duration,
    /// Non-exempt tool active without progress → probably blocked on approval
    pub permission: Duration,
    /// Cosmetic delay before a completed tool is reported as done
    pub tool_done: Duration,
}

impl Default for TimerDelays {
    fn default() -> Self {
        Self {
            text_idle: Duration::from_millis(5000),
            permission: Duration::from_millis(7000),
            tool_done: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Waiting,
    Permission,
}

/// The two single-shot timers of one session.
///
/// Each slot holds at most one deadline; starting a timer replaces any
/// pending one of the same kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTimers {
    waiting: Option<Instant>,
    permission: Option<Instant>,
}

impl SessionTimers {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<Instant> {
        match kind {
            TimerKind::Waiting => &mut self.waiting,
            TimerKind::Permission => &mut self.permission,
        }
    }

    pub fn start(&mut self, kind: TimerKind, deadline: Instant) {
        *self.slot(kind) = Some(deadline);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        *self.slot(kind) = None;
    }

    pub fn cancel_all(&mut self) {
        self.waiting = None;
        self.permission = None;
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        match kind {
            TimerKind::Waiting => self.waiting,
            TimerKind::Permission => self.permission,
        }
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.deadline(kind).is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.waiting.into_iter().chain(self.permission).min()
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// earliest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut fired: Vec<(Instant, TimerKind)> = Vec::with_capacity(2);
        for kind in [TimerKind::Waiting, TimerKind::Permission] {
            let slot = self.slot(kind);
            if let Some(deadline) = *slot
                && deadline <= now
            {
                *slot = None;
                fired.push((deadline, kind));
            }
        }
        fired.sort_by_key(|(deadline, _)| *deadline);
        fired.into_iter().map(|(_, kind)| kind).collect()
    }
}

/// An event held back until `due`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deferred {
    pub due: Instant,
    pub event: AgentEvent,
}

/// Queue of delayed cosmetic events, ordered by due time.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    items: VecDeque<Deferred>,
}

impl DeferredQueue {
    pub fn push(&mut self, due: Instant, event: AgentEvent) {
        let idx = self.items.partition_point(|d| d.due <= due);
        self.items.insert(idx, Deferred { due, event });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.items.front().map(|d| d.due)
    }

    /// Pop every event due at or before `now`, in due order.
    pub fn take_due(&mut self, now: Instant) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while self.items.front().is_some_and(|d| d.due <= now) {
            if let Some(d) = self.items.pop_front() {
                out.push(d.event);
            }
        }
        out
    }

    /// Drop everything pending for a torn-down session.
    pub fn discard_for(&mut self, agent_id: AgentId) {
        self.items.retain(|d| d.event.agent_id() != agent_id);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
