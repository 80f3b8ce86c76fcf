//! Session registry - owns every tracked session and routes input to it
//!
//! All mutation happens through `&mut self` on one logical thread: tailer
//! reads, discovery diffs, and timer expirations are applied here in the
//! order the driver hands them in. Events accumulate in an outbox that the
//! driver drains after each step.

use crate::config::PersistedSession;
use crate::discovery::{ActiveSession, DiscoveryDiff};
use crate::session::SessionState;
use crate::tailer::FileTailer;
use crate::timers::{DeferredQueue, TimerDelays};
use crate::tracker::Effects;
use crate::{AgentEvent, AgentId};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Sessions attached and detached by one discovery diff
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    pub attached: Vec<AgentId>,
    pub detached: Vec<AgentId>,
}

/// Registry of tracked sessions
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: BTreeMap<AgentId, SessionState>,
    by_key: HashMap<String, AgentId>,
    next_id: u32,
    delays: TimerDelays,
    deferred: DeferredQueue,
    outbox: Vec<AgentEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(TimerDelays::default())
    }
}

impl SessionRegistry {
    pub fn new(delays: TimerDelays) -> Self {
        Self {
            sessions: BTreeMap::new(),
            by_key: HashMap::new(),
            next_id: 1,
            delays,
            deferred: DeferredQueue::default(),
            outbox: Vec::new(),
        }
    }

    pub fn set_delays(&mut self, delays: TimerDelays) {
        self.delays = delays;
    }

    fn insert(&mut self, session: SessionState) {
        let agent_id = session.agent_id();
        info!(
            %agent_id,
            key = %session.session_key(),
            path = %session.tailer().path().display(),
            offset = session.tailer().offset(),
            "session attached"
        );
        self.outbox.push(AgentEvent::SessionAttached {
            agent_id,
            session_key: session.session_key().to_string(),
            project_label: session.project_label().to_string(),
            transcript_path: session.tailer().path().to_path_buf(),
        });
        self.by_key.insert(session.session_key().to_string(), agent_id);
        self.sessions.insert(agent_id, session);
        debug!("{} tracked session(s)", self.sessions.len());
    }

    /// Start tracking a discovered session, tailing from its current end of file.
    ///
    /// Returns `None` if a session with the same key is already tracked.
    pub fn attach(&mut self, active: &ActiveSession) -> Option<AgentId> {
        if self.by_key.contains_key(&active.id) {
            return None;
        }
        let agent_id = AgentId(self.next_id);
        self.next_id += 1;
        self.insert(SessionState::new(
            agent_id,
            active.id.clone(),
            active.project_label.clone(),
            FileTailer::at_end(active.transcript_path.clone()),
        ));
        Some(agent_id)
    }

    /// Reattach sessions remembered from a previous run.
    ///
    /// Only sessions whose transcript still exists come back, tailing from the
    /// current end of file. The id counter moves past every restored id.
    pub fn restore(&mut self, persisted: &[PersistedSession]) -> Vec<AgentId> {
        let mut restored = Vec::new();
        for p in persisted {
            if !p.transcript_path.exists() {
                debug!(path = %p.transcript_path.display(), "skipping restore; transcript gone");
                continue;
            }
            if self.sessions.contains_key(&p.agent_id) || self.by_key.contains_key(&p.session_key)
            {
                continue;
            }
            self.insert(SessionState::new(
                p.agent_id,
                p.session_key.clone(),
                p.project_label.clone(),
                FileTailer::at_end(p.transcript_path.clone()),
            ));
            self.next_id = self.next_id.max(p.agent_id.0.saturating_add(1));
            restored.push(p.agent_id);
        }
        restored
    }

    /// Stop tracking a session. Its timers and pending deferred events go with it.
    ///
    /// Returns the transcript path of the detached session.
    pub fn detach(&mut self, agent_id: AgentId) -> Option<PathBuf> {
        let session = self.sessions.remove(&agent_id)?;
        self.by_key.remove(session.session_key());
        self.deferred.discard_for(agent_id);
        info!(%agent_id, key = %session.session_key(), "session detached");
        self.outbox.push(AgentEvent::SessionDetached { agent_id });
        debug!("{} tracked session(s)", self.sessions.len());
        Some(session.tailer().path().to_path_buf())
    }

    /// Apply a discovery diff: attach added sessions, detach removed ones.
    pub fn apply_discovery(&mut self, diff: &DiscoveryDiff) -> DiscoveryOutcome {
        let mut outcome = DiscoveryOutcome::default();
        for removed in &diff.removed {
            if let Some(&agent_id) = self.by_key.get(&removed.id)
                && self.detach(agent_id).is_some()
            {
                outcome.detached.push(agent_id);
            }
        }
        for added in &diff.added {
            if let Some(agent_id) = self.attach(added) {
                outcome.attached.push(agent_id);
            }
        }
        outcome
    }

    /// Read and apply new lines for one session.
    pub fn poll_session(&mut self, agent_id: AgentId, now: Instant) {
        let Some(session) = self.sessions.get_mut(&agent_id) else {
            return;
        };
        let lines = match session.tailer.read_new_lines() {
            Ok(lines) => lines,
            Err(e) => {
                // Vanished or unreadable file: retry on the next trigger.
                debug!(%agent_id, error = %e, "transcript read failed");
                return;
            }
        };
        if lines.is_empty() {
            return;
        }

        let mut fx = Effects {
            now,
            delays: self.delays,
            events: &mut self.outbox,
            deferred: &mut self.deferred,
        };
        session.apply_lines(&lines, &mut fx);
    }

    /// Read every session whose transcript lives at `path`.
    ///
    /// Returns `false` when no tracked session uses that file.
    pub fn poll_path(&mut self, path: &Path, now: Instant) -> bool {
        let ids: Vec<AgentId> = self
            .sessions
            .values()
            .filter(|s| s.tailer().path() == path)
            .map(SessionState::agent_id)
            .collect();
        let matched = !ids.is_empty();
        for agent_id in ids {
            self.poll_session(agent_id, now);
        }
        matched
    }

    /// Read every tracked session (the fallback poll).
    pub fn poll_all(&mut self, now: Instant) {
        let ids: Vec<AgentId> = self.sessions.keys().copied().collect();
        for agent_id in ids {
            self.poll_session(agent_id, now);
        }
    }

    /// Fire every expired timer and release every due deferred event.
    pub fn fire_due(&mut self, now: Instant) {
        let delays = self.delays;
        for session in self.sessions.values_mut() {
            let expired = session.timers.take_expired(now);
            if expired.is_empty() {
                continue;
            }
            let mut fx = Effects {
                now,
                delays,
                events: &mut self.outbox,
                deferred: &mut self.deferred,
            };
            for kind in expired {
                session.on_timer(kind, &mut fx);
            }
        }
        let due = self.deferred.take_due(now);
        self.outbox.extend(due);
    }

    /// Earliest pending timer or deferred event across all sessions
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|s| s.timers().next_deadline())
            .chain(self.deferred.next_deadline())
            .min()
    }

    /// Take every event produced since the last drain, in order.
    pub fn drain_events(&mut self) -> Vec<AgentEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Sessions in a form that can be restored after a restart
    pub fn snapshot(&self) -> Vec<PersistedSession> {
        self.sessions
            .values()
            .map(|s| PersistedSession {
                agent_id: s.agent_id(),
                session_key: s.session_key().to_string(),
                transcript_path: s.tailer().path().to_path_buf(),
                project_label: s.project_label().to_string(),
            })
            .collect()
    }

    pub fn get(&self, agent_id: AgentId) -> Option<&SessionState> {
        self.sessions.get(&agent_id)
    }

    pub fn id_for_key(&self, key: &str) -> Option<AgentId> {
        self.by_key.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentStatus;
    use crate::timers::TimerKind;
    use std::io::Write;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn active(dir: &Path, name: &str) -> ActiveSession {
        let path = dir.join(name);
        if !path.exists() {
            std::fs::write(&path, b"").unwrap();
        }
        ActiveSession {
            id: format!("proj/{name}"),
            transcript_path: path,
            last_modified: SystemTime::now(),
            project_label: "proj".into(),
        }
    }

    fn append(path: &Path, line: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap();
        writeln!(file, "{line}").unwrap();
    }

    #[test]
    fn attach_starts_at_end_of_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.jsonl");
        std::fs::write(&path, "{\"type\":\"system\",\"subtype\":\"turn_duration\"}\n").unwrap();

        let mut registry = SessionRegistry::default();
        let id = registry.attach(&active(tmp.path(), "a.jsonl")).unwrap();
        assert_eq!(id, AgentId(1));
        assert!(matches!(
            registry.drain_events().as_slice(),
            [AgentEvent::SessionAttached { agent_id: AgentId(1), .. }]
        ));

        // Backlog is not replayed.
        registry.poll_all(Instant::now());
        assert!(registry.drain_events().is_empty());

        append(&path, r#"{"type":"system","subtype":"turn_duration"}"#);
        registry.poll_all(Instant::now());
        assert_eq!(
            registry.drain_events(),
            vec![AgentEvent::StatusChanged {
                agent_id: id,
                status: AgentStatus::Waiting
            }]
        );
    }

    #[test]
    fn attaching_same_key_twice_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let mut registry = SessionRegistry::default();
        let session = active(tmp.path(), "a.jsonl");

        assert!(registry.attach(&session).is_some());
        assert!(registry.attach(&session).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn discovery_diff_attaches_and_detaches() {
        let tmp = TempDir::new().unwrap();
        let mut registry = SessionRegistry::default();
        let a = active(tmp.path(), "a.jsonl");
        let b = active(tmp.path(), "b.jsonl");

        let outcome = registry.apply_discovery(&DiscoveryDiff {
            added: vec![a.clone(), b.clone()],
            removed: vec![],
        });
        assert_eq!(outcome.attached, vec![AgentId(1), AgentId(2)]);
        assert_eq!(registry.len(), 2);

        // Already tracked: no second attach.
        let outcome = registry.apply_discovery(&DiscoveryDiff {
            added: vec![b.clone()],
            removed: vec![a.clone()],
        });
        assert_eq!(outcome.detached, vec![AgentId(1)]);
        assert!(outcome.attached.is_empty());
        assert_eq!(registry.id_for_key("proj/a.jsonl"), None);
        assert!(registry.id_for_key("proj/b.jsonl").is_some());
    }

    #[test]
    fn detach_drops_timers_and_deferred_events() {
        let tmp = TempDir::new().unwrap();
        let mut registry = SessionRegistry::default();
        let a = active(tmp.path(), "a.jsonl");
        let id = registry.attach(&a).unwrap();

        let t0 = Instant::now();
        append(
            &a.transcript_path,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{}}]}}"#,
        );
        registry.poll_session(id, t0);
        append(
            &a.transcript_path,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1"}]}}"#,
        );
        append(
            &a.transcript_path,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t2","name":"Bash","input":{}}]}}"#,
        );
        registry.poll_session(id, t0);
        assert!(registry.next_deadline().is_some());
        assert!(
            registry
                .get(id)
                .unwrap()
                .timers()
                .is_pending(TimerKind::Permission)
        );

        registry.detach(id);
        registry.drain_events();
        assert_eq!(registry.next_deadline(), None);

        registry.fire_due(t0 + Duration::from_secs(60));
        assert!(registry.drain_events().is_empty());
        assert!(registry.detach(id).is_none());
    }

    #[test]
    fn timers_fire_through_registry() {
        let tmp = TempDir::new().unwrap();
        let mut registry = SessionRegistry::default();
        let a = active(tmp.path(), "a.jsonl");
        let id = registry.attach(&a).unwrap();
        registry.drain_events();

        let t0 = Instant::now();
        append(
            &a.transcript_path,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#,
        );
        assert!(registry.poll_path(&a.transcript_path, t0));
        assert!(!registry.poll_path(&tmp.path().join("other.jsonl"), t0));
        assert!(registry.drain_events().is_empty());
        assert_eq!(
            registry.next_deadline(),
            Some(t0 + TimerDelays::default().text_idle)
        );

        registry.fire_due(t0 + Duration::from_secs(1));
        assert!(registry.drain_events().is_empty());

        registry.fire_due(t0 + Duration::from_secs(5));
        assert_eq!(
            registry.drain_events(),
            vec![AgentEvent::StatusChanged {
                agent_id: id,
                status: AgentStatus::Waiting
            }]
        );
    }

    #[test]
    fn restore_skips_missing_files_and_advances_ids() {
        let tmp = TempDir::new().unwrap();
        let present = tmp.path().join("a.jsonl");
        std::fs::write(&present, b"{}\n").unwrap();

        let persisted = vec![
            PersistedSession {
                agent_id: AgentId(7),
                session_key: "proj/a.jsonl".into(),
                transcript_path: present.clone(),
                project_label: "proj".into(),
            },
            PersistedSession {
                agent_id: AgentId(12),
                session_key: "proj/gone.jsonl".into(),
                transcript_path: tmp.path().join("gone.jsonl"),
                project_label: "proj".into(),
            },
        ];

        let mut registry = SessionRegistry::default();
        assert_eq!(registry.restore(&persisted), vec![AgentId(7)]);
        assert_eq!(registry.get(AgentId(7)).unwrap().tailer().offset(), 3);
        assert_eq!(registry.snapshot(), vec![persisted[0].clone()]);

        let next = registry.attach(&active(tmp.path(), "b.jsonl")).unwrap();
        assert_eq!(next, AgentId(8));
    }

    #[test]
    fn vanished_file_keeps_session_tracked() {
        let tmp = TempDir::new().unwrap();
        let mut registry = SessionRegistry::default();
        let a = active(tmp.path(), "a.jsonl");
        let id = registry.attach(&a).unwrap();

        std::fs::remove_file(&a.transcript_path).unwrap();
        registry.poll_all(Instant::now());
        assert!(registry.get(id).is_some());
    }
}
