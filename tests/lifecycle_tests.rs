//! Lifecycle tests against real processes.
//!
//! `sleep` stands in for the annotation tool: `spin` launches `sleep <secs>`
//! and cleanup has to signal an actual process group. `sh` scripts stand in
//! where a test needs to see what the tool received.
#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use progeny::config::{ProgenyConfig, ProgenyToml};
use progeny::errors::ProgenyError;
use progeny::spinner::command::CommandSpec;
use progeny::spinner::manager::{LifecycleManager, SpinRequest};
use progeny::spinner::models::Selector;
use progeny::spinner::process::{is_process_alive, terminate_process};
use progeny::spinner::reaper::Reaper;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn project(tool: &str, range: (u16, u16)) -> (TempDir, ProgenyConfig) {
    let dir = TempDir::new().unwrap();
    let mut toml = ProgenyToml::default();
    toml.ports.min = range.0;
    toml.ports.max = range.1;
    toml.ports.skip_bound = false;
    toml.cleaning.grace_period_secs = 1;
    toml.tool.command = Some(tool.to_string());
    toml.tool.startup_grace_ms = 200;
    toml.tool.log_dir = Some(PathBuf::from("sessions"));
    let path = dir.path().join("progeny.toml");
    toml.save(&path).unwrap();
    let config = ProgenyConfig { path, toml };
    (dir, config)
}

async fn wait_until_dead(pid: u32) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while is_process_alive(pid) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "pid {pid} still alive"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn open(config: &ProgenyConfig) -> Arc<LifecycleManager> {
    let (manager, _) = LifecycleManager::open(config).await.unwrap();
    manager
}

#[tokio::test]
async fn test_spin_launches_and_cleanup_terminates() {
    let (_dir, config) = project("sleep", (42200, 42201));
    let manager = open(&config).await;

    let outcome = manager
        .spin(SpinRequest::new("alice", CommandSpec::raw("30")))
        .await
        .unwrap();
    assert_eq!(outcome.port, 42200);

    let session = manager
        .lookup(&Selector::Port(42200))
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(session.command, "sleep 30");
    assert!(is_process_alive(session.pid));

    let cleaned = manager.cleanup(&Selector::Port(42200)).await.unwrap();
    assert_eq!(cleaned.len(), 1);
    wait_until_dead(session.pid).await;
    assert_eq!(manager.free_ports().await.unwrap(), 2);
}

#[tokio::test]
async fn test_tool_receives_port_and_session_environment() {
    let (dir, config) = project("sh -c", (42210, 42211));
    let manager = open(&config).await;

    let script = r#"'echo "$PRODIGY_PORT $PRODIGY_ALLOWED_SESSIONS"; echo "$PRODIGY_CONFIG_OVERRIDES"; sleep 30'"#;
    let mut overrides = progeny::spinner::command::ToolConfig::new();
    overrides.insert("batch_size".into(), serde_json::json!(7));
    manager
        .spin(SpinRequest::new("bob", CommandSpec::raw(script).with_config(overrides)))
        .await
        .unwrap();

    let log = dir.path().join("sessions/bob.log");
    let content = std::fs::read_to_string(&log).unwrap();
    let mut lines = content.lines();
    assert_eq!(lines.next(), Some("42210 bob"));
    let config: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
    assert_eq!(config["port"], 42210);
    assert_eq!(config["batch_size"], 7);

    manager
        .cleanup(&Selector::Username("bob".into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_recipe_arguments_are_not_shell_expanded() {
    // The tool echoes back every argument it receives, one per line.
    let (dir, config) = project(
        r#"sh -c 'printf "%s\n" "$@"; sleep 30' tool"#,
        (42215, 42216),
    );
    let manager = open(&config).await;
    let marker = dir.path().join("pwned");
    let substitution = format!("$(touch {})", marker.display());

    let mut kwargs = std::collections::BTreeMap::new();
    kwargs.insert("label".to_string(), serde_json::json!("A B; touch x"));
    let spec = CommandSpec::recipe(
        "textcat.manual",
        vec![substitution.clone(), "news db".to_string()],
        kwargs,
    );
    manager
        .spin(SpinRequest::new("ivy", spec))
        .await
        .unwrap();

    let log = std::fs::read_to_string(dir.path().join("sessions/ivy.log")).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(
        lines,
        vec![
            "textcat.manual",
            substitution.as_str(),
            "news db",
            "--label",
            "A B; touch x"
        ]
    );
    assert!(!marker.exists());

    manager
        .cleanup(&Selector::SessionName("ivy".into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_launch_rolls_back() {
    let (_dir, config) = project("/nonexistent/prodigy", (42220, 42220));
    let manager = open(&config).await;

    let err = manager
        .spin(SpinRequest::new("carol", CommandSpec::raw("serve")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProgenyError::Launch { .. }), "{err}");
    assert!(manager.list().await.unwrap().is_empty());
    assert_eq!(manager.free_ports().await.unwrap(), 1);
}

#[tokio::test]
async fn test_registry_survives_restart_and_prunes_dead_sessions() {
    let (_dir, config) = project("sleep", (42230, 42232));

    let first = open(&config).await;
    first
        .spin(SpinRequest::new("dave", CommandSpec::raw("30")))
        .await
        .unwrap();
    first
        .spin(SpinRequest::new("erin", CommandSpec::raw("30")))
        .await
        .unwrap();
    let sessions = first.list().await.unwrap();
    drop(first);

    // Both processes are still running, so nothing is pruned
    let (second, pruned) = LifecycleManager::open(&config).await.unwrap();
    assert!(pruned.is_empty());
    assert_eq!(second.list().await.unwrap(), sessions);
    assert_eq!(second.free_ports().await.unwrap(), 1);
    drop(second);

    // erin's instance dies behind the manager's back
    let erin = sessions.iter().find(|s| s.username == "erin").unwrap();
    terminate_process(erin.pid, Duration::from_secs(1))
        .await
        .unwrap();
    wait_until_dead(erin.pid).await;

    let (third, pruned) = LifecycleManager::open(&config).await.unwrap();
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].session_name, "erin");
    assert_eq!(third.free_ports().await.unwrap(), 2);

    // The freed port is handed out again
    let next = third
        .spin(SpinRequest::new("frank", CommandSpec::raw("30")))
        .await
        .unwrap();
    assert_eq!(next.port, erin.port);

    third.cleanup_all().await.unwrap();
    assert!(third.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reaper_terminates_timed_out_sessions() {
    let (_dir, config) = project("sleep", (42240, 42241));
    let manager = open(&config).await;
    manager
        .spin(SpinRequest::new("gina", CommandSpec::raw("30")))
        .await
        .unwrap();
    let pid = manager.list().await.unwrap()[0].pid;

    let cancel = CancellationToken::new();
    let handle = Reaper::new(
        manager.clone(),
        Duration::from_millis(100),
        Duration::from_millis(0),
    )
    .spawn(cancel.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !manager.list().await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "session never reaped");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    wait_until_dead(pid).await;

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_cleanup_of_session_killed_externally() {
    let (_dir, config) = project("sleep", (42250, 42251));
    let manager = open(&config).await;
    manager
        .spin(SpinRequest::new("hank", CommandSpec::raw("30")))
        .await
        .unwrap();
    let pid = manager.list().await.unwrap()[0].pid;

    terminate_process(pid, Duration::from_secs(1)).await.unwrap();
    wait_until_dead(pid).await;

    let cleaned = manager
        .cleanup(&Selector::SessionName("hank".into()))
        .await
        .unwrap();
    assert_eq!(cleaned.len(), 1);
    assert_eq!(manager.free_ports().await.unwrap(), 2);
}
