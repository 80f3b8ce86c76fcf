//! Session discovery.
//!
//! Scans the configured watch directories for recently modified `*.jsonl`
//! transcripts and diffs each scan against the previous one. The window is
//! sliding: "recent" is recomputed from `now` on every scan.

use crate::config::{WatchDirectory, WatchKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// A transcript that was modified recently enough to count as live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    /// `"<project_label>/<file name>"`
    pub id: String,
    pub transcript_path: PathBuf,
    pub last_modified: SystemTime,
    pub project_label: String,
}

/// Result of one scan, compared to the previous one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryDiff {
    pub added: Vec<ActiveSession>,
    pub removed: Vec<ActiveSession>,
}

impl DiscoveryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub(crate) fn is_jsonl(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"))
}

fn modified_within(modified: SystemTime, now: SystemTime, window: Duration) -> bool {
    let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
    age <= window
}

fn dir_label(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

/// `*.jsonl` files directly inside `dir`. Unreadable directories yield nothing.
fn read_dir_jsonl(dir: &Path) -> Vec<(PathBuf, SystemTime)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "cannot read watch directory");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_jsonl(&path) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        if let Ok(modified) = meta.modified() {
            out.push((path, modified));
        }
    }
    out
}

/// Project subdirectories directly under a multi-project root
pub(crate) fn project_dirs(root: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(e) => {
            debug!(path = %root.display(), error = %e, "cannot read project root");
            return Vec::new();
        }
    };
    entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.path())
        .collect()
}

fn collect_project(
    project_dir: &Path,
    window: Duration,
    now: SystemTime,
    found: &mut BTreeMap<String, ActiveSession>,
) {
    let label = dir_label(project_dir);
    for (path, modified) in read_dir_jsonl(project_dir) {
        if !modified_within(modified, now, window) {
            continue;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = format!("{label}/{file_name}");
        found.insert(
            id.clone(),
            ActiveSession {
                id,
                transcript_path: path,
                last_modified: modified,
                project_label: label.clone(),
            },
        );
    }
}

/// Find every live transcript under the given watch directories.
pub fn scan_active_sessions(
    dirs: &[WatchDirectory],
    window: Duration,
    now: SystemTime,
) -> BTreeMap<String, ActiveSession> {
    let mut found = BTreeMap::new();
    for dir in dirs {
        match dir.kind {
            WatchKind::SingleProject => collect_project(&dir.path, window, now, &mut found),
            WatchKind::MultiProjectRoot => {
                for project in project_dirs(&dir.path) {
                    collect_project(&project, window, now, &mut found);
                }
            }
        }
    }
    found
}

/// Compare two scans by id: `added = new \ old`, `removed = old \ new`.
pub fn diff_sessions(
    old: &BTreeMap<String, ActiveSession>,
    new: &BTreeMap<String, ActiveSession>,
) -> DiscoveryDiff {
    DiscoveryDiff {
        added: new
            .iter()
            .filter(|(id, _)| !old.contains_key(*id))
            .map(|(_, s)| s.clone())
            .collect(),
        removed: old
            .iter()
            .filter(|(id, _)| !new.contains_key(*id))
            .map(|(_, s)| s.clone())
            .collect(),
    }
}

/// Owns the known-sessions map between scans.
#[derive(Debug, Default)]
pub struct SessionDiscovery {
    known: BTreeMap<String, ActiveSession>,
}

impl SessionDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan once. Returns a diff only when something was added or removed.
    pub fn scan(
        &mut self,
        dirs: &[WatchDirectory],
        window: Duration,
        now: SystemTime,
    ) -> Option<DiscoveryDiff> {
        let current = scan_active_sessions(dirs, window, now);
        let diff = diff_sessions(&self.known, &current);
        self.known = current;

        if diff.is_empty() {
            return None;
        }
        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "session discovery changed"
        );
        Some(diff)
    }

    pub fn known(&self) -> impl Iterator<Item = &ActiveSession> {
        self.known.values()
    }
}
