//! agent-pulse - watch coding-agent transcripts and print status events
//!
//! Each event is written to stdout as one JSON line. Logs go to stderr.

use agent_pulse::AgentEvent;
use agent_pulse::config::{
    Config, State, WatchDirectory, default_state_path, load_config, load_config_strict,
    load_state, save_state,
};
use agent_pulse::discovery::scan_active_sessions;
use agent_pulse::watcher;
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::SystemTime;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "agent-pulse", about = "Live status for coding-agent sessions")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file to use instead of the platform default
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Watch a single project directory (repeatable; replaces configured directories)
    #[arg(long = "dir", value_name = "PATH")]
    dirs: Vec<PathBuf>,

    /// Watch a root with one subdirectory per project (repeatable)
    #[arg(long = "root", value_name = "PATH")]
    roots: Vec<PathBuf>,

    /// Start fresh instead of restoring sessions from the last run
    #[arg(long)]
    no_restore: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run one discovery pass and list the active sessions
    Scan,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("AGENT_PULSE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

impl Cli {
    fn resolve_config(&self) -> Config {
        let mut config = match &self.config {
            Some(path) => load_config_strict(path).unwrap_or_else(|e| {
                warn!(error = %e, "using default configuration");
                Config::default()
            }),
            None => load_config(),
        };

        if !self.dirs.is_empty() || !self.roots.is_empty() {
            config.watch_directories = self
                .dirs
                .iter()
                .map(WatchDirectory::single_project)
                .chain(self.roots.iter().map(WatchDirectory::multi_project_root))
                .collect();
        }
        config
    }
}

fn print_event(out: &mut impl Write, event: &AgentEvent) -> io::Result<()> {
    let line = serde_json::to_string(event).map_err(io::Error::other)?;
    writeln!(out, "{line}")?;
    out.flush()
}

fn scan(config: &Config) -> ExitCode {
    let found = scan_active_sessions(
        &config.watch_directories,
        config.active_threshold(),
        SystemTime::now(),
    );
    let mut out = io::stdout().lock();
    for session in found.values() {
        if writeln!(out, "{}\t{}", session.id, session.transcript_path.display()).is_err() {
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

async fn run(config: Config, restore: bool) -> ExitCode {
    let persisted = if restore {
        load_state().sessions
    } else {
        Vec::new()
    };
    let (handle, mut rx) = watcher::spawn(config, &persisted);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut stdout = io::stdout();
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = print_event(&mut stdout, &event) {
                    warn!(error = %e, "stdout closed");
                    break;
                }
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    let mut code = ExitCode::SUCCESS;
    if let Some(sessions) = handle.snapshot().await {
        let count = sessions.len();
        match save_state(&State { sessions }) {
            Ok(()) => info!(
                count,
                path = ?default_state_path(),
                "saved tracked sessions"
            ),
            Err(e) => {
                warn!(error = %e, "failed to save state");
                code = ExitCode::FAILURE;
            }
        }
    }
    handle.shutdown();
    code
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.resolve_config();
    match cli.command {
        Some(Command::Scan) => scan(&config),
        None => run(config, !cli.no_restore).await,
    }
}
