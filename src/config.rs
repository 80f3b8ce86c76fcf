//! Persistence for configuration and runtime state.
//!
//! - **Config** (`config.json`): watch directories, activity threshold and
//!   heuristic delays, read from the platform config directory.
//! - **State** (`state.json`): sessions tracked at shutdown, saved to the
//!   platform data directory and restored on the next start.
//!
//! On macOS both resolve to `~/Library/Application Support/agent-pulse/`.

use crate::AgentId;
use crate::error::{Error, Result};
use crate::timers::TimerDelays;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "agent-pulse";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// How a watch directory is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchKind {
    /// `*.jsonl` transcripts sit directly inside the directory
    SingleProject,
    /// One subdirectory per project, transcripts inside each
    MultiProjectRoot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchDirectory {
    pub kind: WatchKind,
    pub path: PathBuf,
}

impl WatchDirectory {
    pub fn single_project(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: WatchKind::SingleProject,
            path: path.into(),
        }
    }

    pub fn multi_project_root(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: WatchKind::MultiProjectRoot,
            path: path.into(),
        }
    }
}

/// User configuration (persisted to config.json).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watch_directories: Vec<WatchDirectory>,
    /// Files modified within this many minutes count as live
    pub active_threshold_minutes: u64,
    pub scan_interval_secs: u64,
    /// Fallback poll for transcript growth, alongside filesystem notifications
    pub poll_interval_ms: u64,
    pub text_idle_delay_ms: u64,
    pub permission_delay_ms: u64,
    pub tool_done_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let delays = TimerDelays::default();
        Self {
            watch_directories: default_watch_directories(),
            active_threshold_minutes: 10,
            scan_interval_secs: 1,
            poll_interval_ms: 1000,
            text_idle_delay_ms: delays.text_idle.as_millis() as u64,
            permission_delay_ms: delays.permission.as_millis() as u64,
            tool_done_delay_ms: delays.tool_done.as_millis() as u64,
        }
    }
}

/// `~/.claude/projects`, one subdirectory per project.
fn default_watch_directories() -> Vec<WatchDirectory> {
    dirs::home_dir()
        .map(|home| vec![WatchDirectory::multi_project_root(home.join(".claude").join("projects"))])
        .unwrap_or_default()
}

impl Config {
    pub fn active_threshold(&self) -> Duration {
        Duration::from_secs(self.active_threshold_minutes.saturating_mul(60))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn timer_delays(&self) -> TimerDelays {
        TimerDelays {
            text_idle: Duration::from_millis(self.text_idle_delay_ms),
            permission: Duration::from_millis(self.permission_delay_ms),
            tool_done: Duration::from_millis(self.tool_done_delay_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A session as remembered across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub agent_id: AgentId,
    pub session_key: String,
    pub transcript_path: PathBuf,
    pub project_label: String,
}

/// Runtime state (persisted to state.json).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub sessions: Vec<PersistedSession>,
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR))
}

fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join(APP_DIR))
}

pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.json"))
}

pub fn default_state_path() -> Option<PathBuf> {
    data_dir().map(|d| d.join("state.json"))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the platform directory, returning defaults if the file
/// is missing or invalid.
pub fn load_config() -> Config {
    match default_config_path() {
        Some(path) => load_config_from(&path),
        None => Config::default(),
    }
}

/// Load state from the platform directory, returning defaults if the file
/// is missing or invalid.
pub fn load_state() -> State {
    match default_state_path() {
        Some(path) => load_state_from(&path),
        None => State::default(),
    }
}

pub fn save_state(state: &State) -> Result<()> {
    let path = default_state_path().ok_or(Error::NoConfigDir)?;
    save_state_to(state, &path)
}

// ---------------------------------------------------------------------------
// Path-parameterised helpers
// ---------------------------------------------------------------------------

pub fn load_config_from(path: &Path) -> Config {
    read_json(path).unwrap_or_default()
}

/// Load config from an explicit path, failing if it cannot be read or parsed.
pub fn load_config_strict(path: &Path) -> Result<Config> {
    read_json(path)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    write_json(config, path)
}

pub fn load_state_from(path: &Path) -> State {
    read_json(path).unwrap_or_default()
}

pub fn save_state_to(state: &State, path: &Path) -> Result<()> {
    write_json(state, path)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_str(&contents).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })?;
    atomic_write(path, json.as_bytes())
}

/// Write bytes to a file atomically: write to a temp file in the same
/// directory, then rename over the target. Prevents partial JSON on crash.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::io(parent, e))?;
    tmp.write_all(data).map_err(|e| Error::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
