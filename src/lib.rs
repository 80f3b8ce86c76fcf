//! agent-pulse - live activity status for coding-agent sessions, inferred
//! from their append-only JSONL transcripts

mod event;
mod session;

pub use event::*;
pub use session::*;

pub mod config;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod tailer;
pub mod timers;
pub mod tracker;
pub mod transcript;
pub mod watcher;
