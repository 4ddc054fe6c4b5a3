use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use super::command::{ToolConfig, display_command};
use crate::errors::ProgenyError;

/// Everything needed to start one tool instance.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub session_name: String,
    pub port: u16,
    /// Recipe arguments, without the tool executable.
    pub args: Vec<String>,
    /// Merged tool config, including the injected port.
    pub config: ToolConfig,
}

/// How a terminated process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited after the graceful signal.
    Exited,
    /// Had to be force-killed after the grace period.
    Killed,
    /// Was not running when termination started.
    AlreadyDead,
}

/// Abstraction over OS process control for testability.
/// Real implementation: `OsProcessDriver`. Test double: `FakeDriver` in the manager tests.
#[async_trait]
pub trait ProcessDriver: Send + Sync {
    /// Full command line a request will run, as recorded in the registry.
    fn command_line(&self, request: &LaunchRequest) -> String;

    /// Start the instance and return its pid.
    async fn launch(&self, request: &LaunchRequest) -> Result<u32, ProgenyError>;

    /// Signal the process to stop, escalating to a forced kill after `grace`.
    async fn terminate(&self, pid: u32, grace: Duration) -> Result<Termination, ProgenyError>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Launch settings for the OS driver.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    /// Tool executable (and leading arguments), e.g. `prodigy`.
    pub tool_cmd: String,
    /// Custom recipe files handed to the tool with `-F`.
    pub recipe_files: Vec<PathBuf>,
    /// A process that exits within this window counts as a failed launch.
    pub startup_grace: Duration,
    /// Upper bound on the spawn itself.
    pub launch_timeout: Duration,
    /// Directory for per-session stdout/stderr logs.
    pub log_dir: Option<PathBuf>,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            tool_cmd: "prodigy".to_string(),
            recipe_files: Vec::new(),
            startup_grace: Duration::from_millis(500),
            launch_timeout: Duration::from_secs(10),
            log_dir: None,
        }
    }
}

/// Spawns tool instances directly as detached process-group leaders.
/// No shell is involved, so recipe arguments reach the tool verbatim.
pub struct OsProcessDriver {
    settings: LaunchSettings,
    tool: Vec<String>,
}

impl OsProcessDriver {
    pub fn new(settings: LaunchSettings) -> Self {
        let tool = match shell_words::split(&settings.tool_cmd) {
            Ok(tool) => tool,
            Err(e) => {
                warn!(tool = %settings.tool_cmd, error = %e, "Tool command does not split cleanly, using it as one executable");
                vec![settings.tool_cmd.clone()]
            }
        };
        Self { settings, tool }
    }

    /// Tool executable, its leading arguments, the recipe arguments, then `-F`.
    fn argv(&self, request: &LaunchRequest) -> Vec<String> {
        let mut argv = self.tool.clone();
        argv.extend(request.args.iter().cloned());
        if !self.settings.recipe_files.is_empty() {
            let files: Vec<String> = self
                .settings
                .recipe_files
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            argv.push("-F".to_string());
            argv.push(files.join(","));
        }
        argv
    }

    fn output_stdio(&self, session_name: &str) -> (Stdio, Stdio) {
        let Some(dir) = &self.settings.log_dir else {
            return (Stdio::null(), Stdio::null());
        };
        let path = dir.join(format!("{}.log", session_name));
        let opened = std::fs::create_dir_all(dir).and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
        });
        match opened.and_then(|file| Ok((file.try_clone()?, file))) {
            Ok((out, err)) => (Stdio::from(out), Stdio::from(err)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot open session log, discarding output");
                (Stdio::null(), Stdio::null())
            }
        }
    }

    fn launch_error(request: &LaunchRequest, message: impl Into<String>) -> ProgenyError {
        ProgenyError::Launch {
            session_name: request.session_name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl ProcessDriver for OsProcessDriver {
    fn command_line(&self, request: &LaunchRequest) -> String {
        display_command(&self.argv(request))
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<u32, ProgenyError> {
        let argv = self.argv(request);
        let Some((program, args)) = argv.split_first() else {
            return Err(Self::launch_error(request, "tool command is empty"));
        };
        let line = display_command(&argv);
        let overrides = serde_json::to_string(&request.config)
            .map_err(|e| Self::launch_error(request, format!("cannot encode config: {}", e)))?;
        let (stdout, stderr) = self.output_stdio(&request.session_name);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .env("PRODIGY_CONFIG_OVERRIDES", overrides)
            .env("PRODIGY_PORT", request.port.to_string())
            .env("PRODIGY_ALLOWED_SESSIONS", &request.session_name)
            .env("PROGENY_SESSION", &request.session_name);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(session = %request.session_name, port = request.port, command = %line, "Spawning instance");
        let spawned = timeout(self.settings.launch_timeout, async { cmd.spawn() })
            .await
            .map_err(|_| Self::launch_error(request, "timed out while spawning"))?;
        let mut child = spawned.map_err(|e| Self::launch_error(request, e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| Self::launch_error(request, "process exited before reporting a pid"))?;

        // An instance that dies straight away (bad recipe, missing binary) is a failed launch.
        match timeout(self.settings.startup_grace, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(Self::launch_error(
                    request,
                    format!("exited during startup with {}", status),
                ));
            }
            Ok(Err(e)) => {
                return Err(Self::launch_error(request, format!("wait failed: {}", e)));
            }
            Err(_) => {}
        }

        let session = request.session_name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(%session, pid, %status, "Instance exited"),
                Err(e) => warn!(%session, pid, error = %e, "Failed to wait on instance"),
            }
        });

        Ok(pid)
    }

    async fn terminate(&self, pid: u32, grace: Duration) -> Result<Termination, ProgenyError> {
        terminate_process(pid, grace).await
    }

    fn is_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }
}

/// Check if a process is running. A pid we may not signal still counts as alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

/// Send `signal` to the process group led by `pid`, falling back to the pid alone.
/// Returns `Ok(false)` when nothing by that id exists.
#[cfg(unix)]
fn send_signal(pid: i32, signal: i32) -> std::io::Result<bool> {
    if unsafe { libc::kill(-pid, signal) } == 0 {
        return Ok(true);
    }
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(err)
}

/// SIGTERM, poll until `grace` elapses, then SIGKILL.
#[cfg(unix)]
pub async fn terminate_process(pid: u32, grace: Duration) -> Result<Termination, ProgenyError> {
    let Ok(raw) = i32::try_from(pid) else {
        return Ok(Termination::AlreadyDead);
    };
    if raw <= 0 || !is_process_alive(pid) {
        return Ok(Termination::AlreadyDead);
    }

    match send_signal(raw, libc::SIGTERM) {
        Ok(true) => {}
        Ok(false) => return Ok(Termination::AlreadyDead),
        Err(source) => return Err(ProgenyError::Termination { pid, source }),
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        sleep(Duration::from_millis(50)).await;
        if !is_process_alive(pid) {
            return Ok(Termination::Exited);
        }
    }

    warn!(pid, grace_secs = grace.as_secs_f64(), "Process ignored SIGTERM, sending SIGKILL");
    match send_signal(raw, libc::SIGKILL) {
        Ok(true) => Ok(Termination::Killed),
        Ok(false) => Ok(Termination::Exited),
        Err(source) => Err(ProgenyError::Termination { pid, source }),
    }
}

#[cfg(not(unix))]
pub async fn terminate_process(pid: u32, _grace: Duration) -> Result<Termination, ProgenyError> {
    Err(ProgenyError::Termination {
        pid,
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process termination is only supported on Unix",
        ),
    })
}
