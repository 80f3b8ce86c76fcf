//! Async driver: turns filesystem activity, poll ticks, scan ticks and timer
//! deadlines into registry steps, and fans the resulting events out.
//!
//! Everything that touches session state runs inside one task, so timer
//! expirations and transcript reads never interleave.

use crate::config::{Config, PersistedSession, WatchDirectory, WatchKind};
use crate::discovery::{SessionDiscovery, is_jsonl, project_dirs};
use crate::error::Result;
use crate::registry::SessionRegistry;
use crate::{AgentEvent, AgentId};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

const EVENT_BUFFER: usize = 256;

#[derive(Debug)]
enum Command {
    Rescan,
    UpdateConfig(Box<Config>),
    CloseSession(AgentId),
    Snapshot(oneshot::Sender<Vec<PersistedSession>>),
    Shutdown,
}

/// Handle to a running driver. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PulseHandle {
    events: broadcast::Sender<AgentEvent>,
    commands: mpsc::UnboundedSender<Command>,
}

#[derive(Debug)]
pub struct EventRx {
    rx: broadcast::Receiver<AgentEvent>,
}

impl EventRx {
    /// Next event, or `None` once the driver has stopped.
    ///
    /// A receiver that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "event receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl PulseHandle {
    pub fn subscribe(&self) -> EventRx {
        EventRx {
            rx: self.events.subscribe(),
        }
    }

    /// Run discovery now instead of waiting for the next scan tick.
    pub fn rescan(&self) {
        let _ = self.commands.send(Command::Rescan);
    }

    /// Swap in new configuration. Discovery reruns immediately.
    pub fn update_config(&self, config: Config) {
        let _ = self.commands.send(Command::UpdateConfig(Box::new(config)));
    }

    pub fn close_session(&self, agent_id: AgentId) {
        let _ = self.commands.send(Command::CloseSession(agent_id));
    }

    /// Currently tracked sessions, or `None` if the driver is gone.
    pub async fn snapshot(&self) -> Option<Vec<PersistedSession>> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Paths reported by the filesystem watcher since the last drain
#[derive(Debug, Default)]
struct DirtyPaths {
    inner: Mutex<DirtyPathsInner>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct DirtyPathsInner {
    paths: HashSet<PathBuf>,
    rescan: bool,
}

impl DirtyPaths {
    fn mark(&self, path: PathBuf) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.paths.insert(path);
        }
        self.notify.notify_one();
    }

    fn mark_rescan(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.rescan = true;
        }
        self.notify.notify_one();
    }

    fn drain(&self) -> (bool, Vec<PathBuf>) {
        let Ok(mut inner) = self.inner.lock() else {
            return (false, Vec::new());
        };
        let rescan = std::mem::take(&mut inner.rescan);
        let mut paths: Vec<PathBuf> = inner.paths.drain().collect();
        paths.sort();
        (rescan, paths)
    }
}

fn make_watcher(dirty: Arc<DirtyPaths>) -> Option<RecommendedWatcher> {
    let result = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(e) => e,
            Err(err) => {
                debug!(error = %err, "file watcher error");
                dirty.mark_rescan();
                return;
            }
        };

        match event.kind {
            EventKind::Access(_) => return,
            // Backends emit `Other` when details are unreliable.
            EventKind::Other => {
                dirty.mark_rescan();
                return;
            }
            _ => {}
        }
        if event.paths.is_empty() {
            dirty.mark_rescan();
            return;
        }

        for path in event.paths {
            if is_jsonl(&path) {
                dirty.mark(path);
            } else {
                // New project directories and renames.
                dirty.mark_rescan();
            }
        }
    });

    match result {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "failed to initialize file watcher; polling only");
            None
        }
    }
}

/// Directories to watch, all non-recursively: every single-project directory,
/// and every multi-project root together with its project subdirectories.
///
/// Transcripts nested deeper than a project directory never reach the driver.
fn watch_targets(dirs: &[WatchDirectory]) -> BTreeSet<PathBuf> {
    let mut targets = BTreeSet::new();
    for dir in dirs {
        if !dir.path.is_dir() {
            continue;
        }
        if dir.kind == WatchKind::MultiProjectRoot {
            targets.extend(project_dirs(&dir.path));
        }
        targets.insert(dir.path.clone());
    }
    targets
}

fn watch_dir(watcher: &mut RecommendedWatcher, path: &Path) -> Result<()> {
    watcher.watch(path, RecursiveMode::NonRecursive)?;
    Ok(())
}

fn new_interval(period: Duration) -> Interval {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

struct Driver {
    config: Config,
    registry: SessionRegistry,
    discovery: SessionDiscovery,
    dirty: Arc<DirtyPaths>,
    watcher: Option<RecommendedWatcher>,
    watched_dirs: BTreeSet<PathBuf>,
    events: broadcast::Sender<AgentEvent>,
}

impl Driver {
    /// Bring directory watches in line with the configured watch directories.
    /// Directories that do not exist yet are picked up on a later scan.
    fn sync_watches(&mut self) {
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };

        let wanted = watch_targets(&self.config.watch_directories);

        let stale: Vec<PathBuf> = self.watched_dirs.difference(&wanted).cloned().collect();
        for path in stale {
            self.watched_dirs.remove(&path);
            if let Err(e) = watcher.unwatch(&path) {
                debug!(path = %path.display(), error = %e, "failed to unwatch directory");
            }
        }

        for path in wanted {
            if self.watched_dirs.contains(&path) {
                continue;
            }
            match watch_dir(watcher, &path) {
                Ok(()) => {
                    debug!(path = %path.display(), "watching directory");
                    self.watched_dirs.insert(path);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to watch directory"),
            }
        }
    }

    fn rescan(&mut self) {
        self.sync_watches();
        let diff = self.discovery.scan(
            &self.config.watch_directories,
            self.config.active_threshold(),
            SystemTime::now(),
        );
        if let Some(diff) = diff {
            let outcome = self.registry.apply_discovery(&diff);
            debug!(
                attached = outcome.attached.len(),
                detached = outcome.detached.len(),
                "applied discovery"
            );
        }
    }

    fn on_dirty(&mut self) {
        let (mut rescan, paths) = self.dirty.drain();
        let now = Instant::now();
        let mut unmatched = false;
        for path in paths {
            if !self.registry.poll_path(&path, now) {
                trace!(path = %path.display(), "change in untracked transcript");
                unmatched = true;
            }
        }
        if unmatched {
            rescan = true;
            // Watch paths may be spelled differently from tracked ones.
            self.registry.poll_all(now);
        }
        if rescan {
            self.rescan();
        }
    }

    fn apply_config(&mut self, config: Config) {
        info!(
            dirs = config.watch_directories.len(),
            threshold_min = config.active_threshold_minutes,
            "configuration updated"
        );
        self.registry.set_delays(config.timer_delays());
        self.config = config;
        self.rescan();
    }

    /// Apply one command. Returns `false` when the driver should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Rescan => self.rescan(),
            Command::UpdateConfig(config) => self.apply_config(*config),
            Command::CloseSession(agent_id) => {
                if self.registry.detach(agent_id).is_none() {
                    debug!(%agent_id, "close requested for unknown session");
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.registry.snapshot());
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn flush(&mut self) {
        for event in self.registry.drain_events() {
            trace!(?event, "agent event");
            let _ = self.events.send(event);
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(
            dirs = self.config.watch_directories.len(),
            "watching agent transcripts"
        );
        self.rescan();
        self.flush();

        let dirty = Arc::clone(&self.dirty);
        let mut periods = (self.config.scan_interval(), self.config.poll_interval());
        let mut scan_tick = new_interval(periods.0);
        let mut poll_tick = new_interval(periods.1);

        loop {
            let deadline = self.registry.next_deadline();
            tokio::select! {
                biased;
                command = commands.recv() => {
                    if !command.is_some_and(|c| self.handle(c)) {
                        break;
                    }
                }
                _ = dirty.notify.notified() => self.on_dirty(),
                _ = sleep_until_deadline(deadline) => {}
                _ = poll_tick.tick() => self.registry.poll_all(Instant::now()),
                _ = scan_tick.tick() => self.rescan(),
            }

            self.registry.fire_due(Instant::now());
            self.flush();

            let current = (self.config.scan_interval(), self.config.poll_interval());
            if current != periods {
                periods = current;
                scan_tick = new_interval(periods.0);
                poll_tick = new_interval(periods.1);
            }
        }

        info!(sessions = self.registry.len(), "transcript watcher stopped");
    }
}

/// Start the driver on the current tokio runtime.
///
/// `restored` sessions are reattached before the first scan. The returned
/// receiver is subscribed before anything is emitted, so it sees the initial
/// `SessionAttached` events.
pub fn spawn(config: Config, restored: &[PersistedSession]) -> (PulseHandle, EventRx) {
    let (events, rx) = broadcast::channel(EVENT_BUFFER);
    let (commands, command_rx) = mpsc::unbounded_channel();

    let mut registry = SessionRegistry::new(config.timer_delays());
    let ids = registry.restore(restored);
    if !ids.is_empty() {
        info!(count = ids.len(), "restored sessions");
    }

    let dirty = Arc::new(DirtyPaths::default());
    let driver = Driver {
        watcher: make_watcher(Arc::clone(&dirty)),
        config,
        registry,
        discovery: SessionDiscovery::new(),
        dirty,
        watched_dirs: BTreeSet::new(),
        events: events.clone(),
    };
    tokio::spawn(driver.run(command_rx));

    (PulseHandle { events, commands }, EventRx { rx })
}
