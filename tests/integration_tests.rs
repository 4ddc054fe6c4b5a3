//! Integration tests for the progeny CLI.
//!
//! Sessions are spun with `sleep` standing in for the annotation tool, so
//! every spun instance is a real process that the CLI must track and reap.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Helper to create a progeny Command
fn progeny() -> Command {
    let mut cmd = cargo_bin_cmd!("progeny");
    cmd.env_remove("PROGENY_CONFIG")
        .env_remove("PROGENY_TOOL_CMD")
        .env_remove("PROGENY_DB_PATH")
        .env_remove("PROGENY_PORT_MIN")
        .env_remove("PROGENY_PORT_MAX")
        .env_remove("RUST_LOG");
    cmd
}

/// Helper to create a project directory with a progeny.toml using `tool` as the tool.
fn create_project(tool: &str, port_min: u16, port_max: u16) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let config = format!(
        r#"
[ports]
min = {port_min}
max = {port_max}
skip_bound = false

[cleaning]
grace_period_secs = 1

[tool]
command = "{tool}"
startup_grace_ms = 300

[registry]
path = "state/processes.db"

[prebaked]
dir = "prebaked"
"#
    );
    let path = dir.path().join("progeny.toml");
    fs::write(&path, config).unwrap();
    (dir, path)
}

/// Helper to run progeny against a project's config file
fn progeny_with(config: &PathBuf) -> Command {
    let mut cmd = progeny();
    cmd.arg("--config").arg(config);
    cmd
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_progeny_help() {
        progeny()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("spin"))
            .stdout(predicate::str::contains("cleanup"));
    }

    #[test]
    fn test_progeny_version() {
        progeny().arg("--version").assert().success();
    }

    #[test]
    fn test_missing_explicit_config_fails() {
        let dir = TempDir::new().unwrap();
        progeny()
            .arg("--config")
            .arg(dir.path().join("missing.toml"))
            .arg("list")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Config file not found"));
    }
}

// =============================================================================
// Config Command Tests
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_init_then_validate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progeny.toml");

        progeny()
            .arg("--config")
            .arg(&path)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created progeny.toml"));
        assert!(path.exists());

        progeny()
            .arg("--config")
            .arg(&path)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));

        progeny()
            .arg("--config")
            .arg(&path)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progeny.toml");
        fs::write(&path, "[ports]\nmin = 9000\nmax = 8000\n").unwrap();

        progeny()
            .arg("--config")
            .arg(&path)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Invalid port range 9000-8000"));
    }

    #[test]
    fn test_config_show_applies_env_overrides() {
        let (_dir, path) = create_project("sleep", 42000, 42001);
        progeny_with(&path)
            .env("PROGENY_PORT_MAX", "42009")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max = 42009"))
            .stdout(predicate::str::contains("command = \"sleep\""));
    }
}

// =============================================================================
// Session Lifecycle Tests
// =============================================================================

#[cfg(unix)]
mod sessions {
    use super::*;

    #[test]
    fn test_spin_list_cleanup_cycle() {
        let (_dir, path) = create_project("sleep", 42110, 42111);

        progeny_with(&path)
            .args(["spin", "--username", "alice", "--command", "30"])
            .assert()
            .success()
            .stdout(predicate::str::contains("session alice on port 42110"))
            .stdout(predicate::str::contains(
                "http://localhost:42110/?session=alice",
            ));

        progeny_with(&path)
            .args(["spin", "--username", "alice", "--command", "30"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("'alice' is already in use"));

        progeny_with(&path)
            .args(["spin", "--username", "alice", "--uniquify", "--command", "30"])
            .assert()
            .success()
            .stdout(predicate::str::contains("session alice-2 on port 42111"));

        progeny_with(&path)
            .args(["spin", "--username", "bob", "--command", "30"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No free port in range 42110-42111"));

        progeny_with(&path)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("alice-2"))
            .stdout(predicate::str::contains("2 live session(s)"));

        progeny_with(&path)
            .args(["list", "--port", "42111"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1 live session(s)"));

        progeny_with(&path)
            .args(["cleanup", "--username", "alice"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cleaned up 2 session(s)"));

        progeny_with(&path)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No live sessions."));

        // Released ports are immediately reusable
        progeny_with(&path)
            .args(["spin", "--username", "bob", "--command", "30"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port 42110"));
        progeny_with(&path)
            .args(["cleanup", "--session-name", "bob"])
            .assert()
            .success();
    }

    #[test]
    fn test_spin_with_recipe_flags_records_command() {
        let (_dir, path) = create_project("sleep", 42120, 42121);

        progeny_with(&path)
            .args([
                "spin", "-u", "carol", "--recipe", "30", "--arg", "31", "--kwarg", "x=1",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to launch"));

        // `sleep 30` with no extra flags survives startup
        progeny_with(&path)
            .args(["spin", "-u", "carol", "--recipe", "30", "--arg", "31"])
            .assert()
            .success();

        progeny_with(&path)
            .args(["list", "--username", "carol"])
            .assert()
            .success()
            .stdout(predicate::str::contains("carol"));

        progeny_with(&path)
            .args(["cleanup", "--port", "42120"])
            .assert()
            .success()
            .stdout(predicate::str::contains("carol (port 42120"));
    }

    #[test]
    fn test_failed_launch_does_not_leak_port() {
        let (_dir, path) = create_project("false", 42130, 42130);

        progeny_with(&path)
            .args(["spin", "-u", "dave", "--command", "ignored"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to launch session 'dave'"));

        progeny_with(&path)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No live sessions."));
    }

    #[test]
    fn test_spin_rejects_unbalanced_quotes() {
        let (_dir, path) = create_project("sleep", 42145, 42146);
        progeny_with(&path)
            .args(["spin", "-u", "erin", "--command", "30 'oops"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Malformed command line"));

        progeny_with(&path)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No live sessions."));
    }

    #[test]
    fn test_spin_rejects_reserved_port_override() {
        let (_dir, path) = create_project("sleep", 42140, 42141);
        progeny_with(&path)
            .args(["spin", "-u", "erin", "--command", "30", "--set", "port=1234"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("'port' is reserved"));
    }

    #[test]
    fn test_spin_prebaked_project() {
        let (dir, path) = create_project("sleep", 42150, 42151);
        fs::create_dir_all(dir.path().join("prebaked")).unwrap();
        fs::write(
            dir.path().join("prebaked/nap.yml"),
            "name: nap\ncommand: \"30\"\nconfig:\n  batch_size: 5\n",
        )
        .unwrap();

        progeny_with(&path)
            .arg("prebaked")
            .assert()
            .success()
            .stdout(predicate::str::contains("nap"))
            .stdout(predicate::str::contains("batch_size"));

        progeny_with(&path)
            .args(["spin", "-u", "frank", "--prebaked", "nap"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port 42150"));

        progeny_with(&path)
            .args(["spin", "-u", "gina", "--prebaked", "missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("missing"));

        progeny_with(&path)
            .args(["cleanup", "--older-than", "0"])
            .assert()
            .success()
            .stdout(predicate::str::contains("frank"));
    }

    #[test]
    fn test_reconcile_prunes_dead_rows() {
        use chrono::Utc;
        use progeny::spinner::db::ProcessRegistry;
        use progeny::spinner::models::Session;

        let (dir, path) = create_project("sleep", 42160, 42161);

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let registry = ProcessRegistry::open(&dir.path().join("state/processes.db")).unwrap();
        registry
            .insert(&Session {
                port: 42160,
                session_name: "ghost".into(),
                username: "ghost".into(),
                command: "sleep 30".into(),
                pid: dead_pid,
                started_at: Utc::now(),
            })
            .unwrap();
        registry.close().unwrap();

        progeny_with(&path)
            .arg("reconcile")
            .assert()
            .success()
            .stdout(predicate::str::contains("1 stale session(s)"))
            .stdout(predicate::str::contains("ghost (port 42160"));

        progeny_with(&path)
            .arg("reconcile")
            .assert()
            .success()
            .stdout(predicate::str::contains("Registry is consistent"));
    }

    #[test]
    fn test_cleanup_requires_exactly_one_selector() {
        let (_dir, path) = create_project("sleep", 42170, 42171);

        progeny_with(&path)
            .arg("cleanup")
            .assert()
            .failure()
            .stderr(predicate::str::contains("exactly one"));

        progeny_with(&path)
            .args(["cleanup", "--port", "42170", "--username", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("got 2"));
    }
}
