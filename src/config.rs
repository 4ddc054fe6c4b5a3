//! Configuration for Progeny, read from `progeny.toml`.
//!
//! Settings are layered file → environment → CLI. A missing file yields the
//! defaults below.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 9000
//! public_host = "annotate.example.com"
//!
//! [ports]
//! min = 8080
//! max = 8090
//! skip_bound = true
//!
//! [cleaning]
//! interval_secs = 300
//! timeout_secs = 14400
//! grace_period_secs = 5
//! cleanup_on_shutdown = false
//!
//! [tool]
//! command = "prodigy"
//! recipe_dir = "recipes"
//! recipe_exclude = "^(_|loader).*"
//! startup_grace_ms = 500
//! launch_timeout_secs = 10
//! log_dir = ".progeny/sessions"
//!
//! [prebaked]
//! dir = "prebaked"
//!
//! [registry]
//! path = ".progeny/processes.db"
//!
//! [logging]
//! dir = ".progeny/logs"
//! json = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::spinner::prebaked::DEFAULT_RECIPE_EXCLUDE;
use crate::spinner::process::LaunchSettings;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "progeny.toml";

/// HTTP management server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Host name used when building session URLs for callers
    #[serde(default = "default_public_host")]
    pub public_host: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    9000
}

fn default_public_host() -> String {
    "localhost".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
            public_host: default_public_host(),
        }
    }
}

/// Port range handed out to spun instances. Both bounds are inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsSection {
    #[serde(default = "default_port_min")]
    pub min: u16,
    #[serde(default = "default_port_max")]
    pub max: u16,
    /// Skip ports some other process already listens on
    #[serde(default = "default_true")]
    pub skip_bound: bool,
}

fn default_port_min() -> u16 {
    8080
}

fn default_port_max() -> u16 {
    8090
}

fn default_true() -> bool {
    true
}

impl Default for PortsSection {
    fn default() -> Self {
        Self {
            min: default_port_min(),
            max: default_port_max(),
            skip_bound: default_true(),
        }
    }
}

/// Scheduled cleaning. Runs only when both interval and timeout are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleaningSection {
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Seconds between SIGTERM and SIGKILL
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Terminate every live session when `serve` shuts down
    #[serde(default)]
    pub cleanup_on_shutdown: bool,
}

fn default_grace_period_secs() -> u64 {
    5
}

impl Default for CleaningSection {
    fn default() -> Self {
        Self {
            interval_secs: None,
            timeout_secs: None,
            grace_period_secs: default_grace_period_secs(),
            cleanup_on_shutdown: false,
        }
    }
}

/// How the annotation tool is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub recipe_dir: Option<PathBuf>,
    #[serde(default = "default_recipe_exclude")]
    pub recipe_exclude: String,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
    /// Per-session stdout/stderr files land here
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_recipe_exclude() -> String {
    DEFAULT_RECIPE_EXCLUDE.to_string()
}

fn default_startup_grace_ms() -> u64 {
    500
}

fn default_launch_timeout_secs() -> u64 {
    10
}

impl Default for ToolSection {
    fn default() -> Self {
        Self {
            command: None,
            recipe_dir: None,
            recipe_exclude: default_recipe_exclude(),
            startup_grace_ms: default_startup_grace_ms(),
            launch_timeout_secs: default_launch_timeout_secs(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrebakedSection {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

fn default_registry_path() -> PathBuf {
    PathBuf::from(".progeny/processes.db")
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Daily rolling log files are written here when set
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

/// Complete `progeny.toml` configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgenyToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub ports: PortsSection,
    #[serde(default)]
    pub cleaning: CleaningSection,
    #[serde(default)]
    pub tool: ToolSection,
    #[serde(default)]
    pub prebaked: PrebakedSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ProgenyToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse progeny.toml")
    }

    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize progeny.toml")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `PROGENY_*` environment overrides through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(cmd) = lookup("PROGENY_TOOL_CMD") {
            self.tool.command = Some(cmd);
        }
        if let Some(path) = lookup("PROGENY_DB_PATH") {
            self.registry.path = PathBuf::from(path);
        }
        if let Some(min) = lookup("PROGENY_PORT_MIN") {
            self.ports.min = min
                .parse()
                .with_context(|| format!("Invalid PROGENY_PORT_MIN '{}'", min))?;
        }
        if let Some(max) = lookup("PROGENY_PORT_MAX") {
            self.ports.max = max
                .parse()
                .with_context(|| format!("Invalid PROGENY_PORT_MAX '{}'", max))?;
        }
        Ok(())
    }

    /// Tool executable, defaulting to `prodigy`.
    pub fn tool_cmd(&self) -> String {
        self.tool
            .command
            .clone()
            .unwrap_or_else(|| "prodigy".to_string())
    }

    pub fn port_range(&self) -> (u16, u16) {
        (self.ports.min, self.ports.max)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.cleaning.grace_period_secs)
    }

    /// Launch settings minus the discovered recipe files.
    pub fn launch_settings(&self) -> LaunchSettings {
        LaunchSettings {
            tool_cmd: self.tool_cmd(),
            recipe_files: Vec::new(),
            startup_grace: Duration::from_millis(self.tool.startup_grace_ms),
            launch_timeout: Duration::from_secs(self.tool.launch_timeout_secs),
            log_dir: self.tool.log_dir.clone(),
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.ports.min == 0 || self.ports.min > self.ports.max {
            warnings.push(format!(
                "Invalid port range {}-{}: min must be non-zero and not above max",
                self.ports.min, self.ports.max
            ));
        }
        if (self.ports.min..=self.ports.max).contains(&self.server.port) {
            warnings.push(format!(
                "Server port {} lies inside the session port range {}-{}",
                self.server.port, self.ports.min, self.ports.max
            ));
        }
        match (self.cleaning.interval_secs, self.cleaning.timeout_secs) {
            (Some(_), None) => warnings.push(
                "cleaning.interval_secs is set without cleaning.timeout_secs; scheduled cleaning is disabled"
                    .to_string(),
            ),
            (None, Some(_)) => warnings.push(
                "cleaning.timeout_secs is set without cleaning.interval_secs; scheduled cleaning is disabled"
                    .to_string(),
            ),
            (Some(0), Some(_)) => {
                warnings.push("cleaning.interval_secs must be greater than 0".to_string())
            }
            _ => {}
        }
        if self.cleaning.grace_period_secs == 0 {
            warnings.push(
                "cleaning.grace_period_secs is 0; sessions are force-killed immediately".to_string(),
            );
        }
        if regex::Regex::new(&self.tool.recipe_exclude).is_err() {
            warnings.push(format!(
                "Invalid tool.recipe_exclude pattern '{}'",
                self.tool.recipe_exclude
            ));
        }

        warnings
    }
}

/// Resolved configuration: where it came from plus the merged settings.
#[derive(Debug, Clone)]
pub struct ProgenyConfig {
    pub path: PathBuf,
    pub toml: ProgenyToml,
}

impl ProgenyConfig {
    /// Resolve the config path (`--config` → `PROGENY_CONFIG` → `./progeny.toml`),
    /// load it and apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit);
        if explicit.is_some() && !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        let mut toml = ProgenyToml::load_or_default(&path)?;
        toml.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(Self { path, toml })
    }

    /// Config file location without loading it.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        match explicit {
            Some(path) => path.to_path_buf(),
            None => std::env::var("PROGENY_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(CONFIG_FILE)),
        }
    }

    /// Relative paths in the file resolve against the file's directory.
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            return relative.to_path_buf();
        }
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(relative),
            _ => relative.to_path_buf(),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.resolve(&self.toml.registry.path)
    }

    pub fn prebaked_dir(&self) -> Option<PathBuf> {
        self.toml.prebaked.dir.as_deref().map(|d| self.resolve(d))
    }

    pub fn recipe_dir(&self) -> Option<PathBuf> {
        self.toml.tool.recipe_dir.as_deref().map(|d| self.resolve(d))
    }

    pub fn tool_log_dir(&self) -> Option<PathBuf> {
        self.toml.tool.log_dir.as_deref().map(|d| self.resolve(d))
    }

    pub fn logging_dir(&self) -> Option<PathBuf> {
        self.toml.logging.dir.as_deref().map(|d| self.resolve(d))
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
