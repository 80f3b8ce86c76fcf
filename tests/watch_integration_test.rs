use agent_pulse::config::{Config, PersistedSession, WatchDirectory};
use agent_pulse::watcher::{self, EventRx};
use agent_pulse::{AgentEvent, AgentId, AgentStatus};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(project: &Path) -> Config {
    Config {
        watch_directories: vec![WatchDirectory::single_project(project)],
        poll_interval_ms: 50,
        text_idle_delay_ms: 200,
        permission_delay_ms: 300,
        tool_done_delay_ms: 50,
        ..Config::default()
    }
}

fn append_jsonl(path: &Path, line: serde_json::Value) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    writeln!(file, "{}", serde_json::to_string(&line).unwrap()).unwrap();
}

async fn recv_until(
    rx: &mut EventRx,
    deadline: Duration,
    mut pred: impl FnMut(&AgentEvent) -> bool,
) -> Vec<AgentEvent> {
    let mut out = Vec::new();
    let start = tokio::time::Instant::now();

    loop {
        let Some(remaining) = deadline.checked_sub(start.elapsed()) else {
            return out;
        };
        if remaining.is_zero() {
            return out;
        }

        match timeout(remaining, rx.recv()).await {
            Ok(Some(ev)) => {
                let done = pred(&ev);
                out.push(ev);
                if done {
                    return out;
                }
            }
            Ok(None) => return out,
            Err(_) => return out,
        }
    }
}

fn attached_id(events: &[AgentEvent], key: &str) -> Option<AgentId> {
    events.iter().find_map(|ev| match ev {
        AgentEvent::SessionAttached {
            agent_id,
            session_key,
            ..
        } if session_key == key => Some(*agent_id),
        _ => None,
    })
}

#[tokio::test(flavor = "current_thread")]
async fn tool_lifecycle_and_permission_heuristic() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("proj");
    std::fs::create_dir(&project).unwrap();
    let transcript = project.join("s1.jsonl");
    // Backlog before attach is never replayed.
    append_jsonl(
        &transcript,
        serde_json::json!({"type":"system","subtype":"turn_duration"}),
    );

    let (handle, mut rx) = watcher::spawn(fast_config(&project), &[]);

    let events = recv_until(&mut rx, WAIT, |ev| {
        matches!(ev, AgentEvent::SessionAttached { .. })
    })
    .await;
    let id = attached_id(&events, "proj/s1.jsonl").expect("session attached");

    append_jsonl(
        &transcript,
        serde_json::json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "cargo build"}}
            ]}
        }),
    );

    let events = recv_until(&mut rx, WAIT, |ev| {
        matches!(ev, AgentEvent::PermissionNeeded { .. })
    })
    .await;
    assert_eq!(
        events,
        vec![
            AgentEvent::StatusChanged {
                agent_id: id,
                status: AgentStatus::Active,
            },
            AgentEvent::ToolStarted {
                agent_id: id,
                tool_id: "toolu_1".into(),
                tool_name: "Bash".into(),
                status: "Running: cargo build".into(),
            },
            AgentEvent::PermissionNeeded {
                agent_id: id,
                parent_tool_id: None,
            },
        ]
    );

    append_jsonl(
        &transcript,
        serde_json::json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "tool_use_id": "toolu_1"}]}
        }),
    );
    let events = recv_until(&mut rx, WAIT, |ev| {
        matches!(ev, AgentEvent::ToolDone { .. })
    })
    .await;
    assert_eq!(
        events,
        vec![
            AgentEvent::PermissionCleared { agent_id: id },
            AgentEvent::ToolDone {
                agent_id: id,
                tool_id: "toolu_1".into(),
            },
        ]
    );

    append_jsonl(
        &transcript,
        serde_json::json!({"type":"system","subtype":"turn_duration"}),
    );
    let events = recv_until(&mut rx, WAIT, |ev| {
        matches!(ev, AgentEvent::StatusChanged { .. })
    })
    .await;
    assert_eq!(
        events.last(),
        Some(&AgentEvent::StatusChanged {
            agent_id: id,
            status: AgentStatus::Waiting,
        })
    );

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].transcript_path, transcript);

    handle.close_session(id);
    let events = recv_until(&mut rx, WAIT, |ev| {
        matches!(ev, AgentEvent::SessionDetached { .. })
    })
    .await;
    assert_eq!(
        events.last(),
        Some(&AgentEvent::SessionDetached { agent_id: id })
    );
    assert_eq!(handle.snapshot().await, Some(Vec::new()));

    handle.shutdown();
}

#[tokio::test(flavor = "current_thread")]
async fn text_only_turn_goes_idle() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("proj");
    std::fs::create_dir(&project).unwrap();
    let transcript = project.join("s1.jsonl");
    std::fs::write(&transcript, b"").unwrap();

    let (handle, mut rx) = watcher::spawn(fast_config(&project), &[]);
    let events = recv_until(&mut rx, WAIT, |ev| {
        matches!(ev, AgentEvent::SessionAttached { .. })
    })
    .await;
    let id = attached_id(&events, "proj/s1.jsonl").expect("session attached");

    append_jsonl(
        &transcript,
        serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "All done."}]}
        }),
    );
    let events = recv_until(&mut rx, WAIT, |ev| {
        matches!(ev, AgentEvent::StatusChanged { .. })
    })
    .await;
    assert_eq!(
        events,
        vec![AgentEvent::StatusChanged {
            agent_id: id,
            status: AgentStatus::Waiting,
        }]
    );

    handle.shutdown();
}

#[tokio::test(flavor = "current_thread")]
async fn new_transcript_is_discovered_after_start() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("proj");
    std::fs::create_dir(&project).unwrap();

    let (handle, mut rx) = watcher::spawn(fast_config(&project), &[]);
    assert_eq!(handle.snapshot().await, Some(Vec::new()));

    append_jsonl(
        &project.join("late.jsonl"),
        serde_json::json!({"type":"user","message":{"content":"hi"}}),
    );
    let events = recv_until(&mut rx, WAIT, |ev| {
        matches!(ev, AgentEvent::SessionAttached { .. })
    })
    .await;
    assert_eq!(attached_id(&events, "proj/late.jsonl"), Some(AgentId(1)));

    handle.shutdown();
}

#[tokio::test(flavor = "current_thread")]
async fn restored_session_keeps_its_id() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("proj");
    std::fs::create_dir(&project).unwrap();
    let transcript = project.join("s1.jsonl");
    std::fs::write(&transcript, b"").unwrap();

    let persisted = vec![PersistedSession {
        agent_id: AgentId(42),
        session_key: "proj/s1.jsonl".into(),
        transcript_path: transcript.clone(),
        project_label: "proj".into(),
    }];
    let (handle, mut rx) = watcher::spawn(fast_config(&project), &persisted);

    let events = recv_until(&mut rx, WAIT, |ev| {
        matches!(ev, AgentEvent::SessionAttached { .. })
    })
    .await;
    assert_eq!(attached_id(&events, "proj/s1.jsonl"), Some(AgentId(42)));
    assert_eq!(handle.snapshot().await, Some(persisted));

    handle.shutdown();
}

fn slow_scan_config(project: &Path) -> Config {
    Config {
        scan_interval_secs: 3600,
        ..fast_config(project)
    }
}

#[tokio::test(flavor = "current_thread")]
async fn config_update_rescans_immediately() {
    let tmp = TempDir::new().unwrap();
    let first = tmp.path().join("a");
    let second = tmp.path().join("b");
    std::fs::create_dir(&first).unwrap();
    std::fs::create_dir(&second).unwrap();
    append_jsonl(
        &second.join("s.jsonl"),
        serde_json::json!({"type":"user","message":{"content":"hi"}}),
    );

    let (handle, mut rx) = watcher::spawn(slow_scan_config(&first), &[]);
    assert_eq!(handle.snapshot().await, Some(Vec::new()));
    tokio::time::sleep(Duration::from_millis(200)).await;

    handle.update_config(slow_scan_config(&second));
    let events = recv_until(&mut rx, Duration::from_secs(2), |ev| {
        matches!(ev, AgentEvent::SessionAttached { .. })
    })
    .await;
    assert_eq!(attached_id(&events, "b/s.jsonl"), Some(AgentId(1)));

    handle.shutdown();
}

#[tokio::test(flavor = "current_thread")]
async fn forced_rescan_finds_new_transcript() {
    let tmp = TempDir::new().unwrap();
    // Not there at start, so nothing watches it.
    let project = tmp.path().join("later");

    let (handle, mut rx) = watcher::spawn(slow_scan_config(&project), &[]);
    assert_eq!(handle.snapshot().await, Some(Vec::new()));
    // The first scan tick fires right away; let it pass before the file exists.
    tokio::time::sleep(Duration::from_millis(200)).await;

    std::fs::create_dir(&project).unwrap();
    append_jsonl(
        &project.join("s.jsonl"),
        serde_json::json!({"type":"user","message":{"content":"hi"}}),
    );

    handle.rescan();
    let events = recv_until(&mut rx, Duration::from_secs(2), |ev| {
        matches!(ev, AgentEvent::SessionAttached { .. })
    })
    .await;
    assert_eq!(attached_id(&events, "later/s.jsonl"), Some(AgentId(1)));

    handle.shutdown();
}
