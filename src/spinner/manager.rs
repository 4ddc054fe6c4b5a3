use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::command::CommandSpec;
use super::db::{ProcessRegistry, RegistryHandle};
use super::models::{Clock, RowFilter, Selector, Session, SystemClock, validate_name};
use super::ports::{PortAllocator, is_port_bound};
use super::prebaked::{PrebakedCatalog, discover_recipes};
use super::process::{LaunchRequest, OsProcessDriver, ProcessDriver, Termination};
use crate::config::ProgenyConfig;
use crate::errors::ProgenyError;

/// A request to spin one instance.
#[derive(Debug, Clone)]
pub struct SpinRequest {
    pub username: String,
    pub spec: CommandSpec,
    /// Explicit session name; defaults to the username.
    pub session_name: Option<String>,
    /// Suffix `-2`, `-3`, ... onto a colliding name instead of failing.
    pub uniquify: bool,
}

impl SpinRequest {
    pub fn new(username: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            username: username.into(),
            spec,
            session_name: None,
            uniquify: false,
        }
    }

    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    pub fn uniquify(mut self, uniquify: bool) -> Self {
        self.uniquify = uniquify;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpinOutcome {
    pub port: u16,
    pub session_name: String,
}

/// Mutable state shared by spin and cleanup. Guarded by one async mutex that is
/// never held across a launch or a termination wait.
#[derive(Debug)]
struct State {
    ports: PortAllocator,
    /// Ports and names handed to spins that have not reached the registry yet.
    pending: HashMap<u16, String>,
    /// Ports whose sessions are being terminated by an in-flight cleanup.
    terminating: HashSet<u16>,
}

impl State {
    /// Rebuild the in-use set from the registry's rows plus this manager's
    /// in-flight work. Other processes sharing the registry file may have
    /// added or removed rows since the last call.
    fn resync(&mut self, live: &[Session]) {
        let ports = live
            .iter()
            .map(|s| s.port)
            .chain(self.pending.keys().copied())
            .chain(self.terminating.iter().copied());
        self.ports.sync_in_use(ports);
    }

    fn name_pending(&self, name: &str) -> bool {
        self.pending.values().any(|pending| pending == name)
    }
}

/// Spins, looks up and cleans up tool instances.
///
/// The registry is the source of truth: the allocator is resynced from it on
/// every spin, and a row is only deleted once its process is known to be gone.
pub struct LifecycleManager {
    registry: RegistryHandle,
    state: Mutex<State>,
    catalog: PrebakedCatalog,
    driver: Arc<dyn ProcessDriver>,
    clock: Arc<dyn Clock>,
    grace_period: Duration,
}

impl LifecycleManager {
    /// Build a manager over an opened registry, seeding the allocator from
    /// its rows. Call [`reconcile`](Self::reconcile) before serving requests.
    pub async fn new(
        registry: RegistryHandle,
        port_range: (u16, u16),
        catalog: PrebakedCatalog,
        driver: Arc<dyn ProcessDriver>,
        clock: Arc<dyn Clock>,
        grace_period: Duration,
    ) -> Result<Self, ProgenyError> {
        let live_ports: Vec<u16> = registry.list().await?.iter().map(|s| s.port).collect();
        let ports = PortAllocator::from_live_ports(port_range.0, port_range.1, live_ports)?;
        Ok(Self::with_allocator(
            registry,
            ports,
            catalog,
            driver,
            clock,
            grace_period,
        ))
    }

    /// Build a manager around a prepared allocator. The allocator must already
    /// reflect the registry's live ports.
    pub fn with_allocator(
        registry: RegistryHandle,
        ports: PortAllocator,
        catalog: PrebakedCatalog,
        driver: Arc<dyn ProcessDriver>,
        clock: Arc<dyn Clock>,
        grace_period: Duration,
    ) -> Self {
        Self {
            registry,
            state: Mutex::new(State {
                ports,
                pending: HashMap::new(),
                terminating: HashSet::new(),
            }),
            catalog,
            driver,
            clock,
            grace_period,
        }
    }

    /// Open the configured registry, load prebaked projects and recipes,
    /// and reconcile the registry against the running processes.
    /// Also returns the stale sessions reconciliation pruned.
    pub async fn open(config: &ProgenyConfig) -> anyhow::Result<(Arc<Self>, Vec<Session>)> {
        let toml = &config.toml;
        let registry_path = config.registry_path();
        let registry = ProcessRegistry::open(&registry_path)
            .with_context(|| format!("Failed to open registry at {}", registry_path.display()))?;
        let registry = RegistryHandle::new(registry);

        let catalog = match config.prebaked_dir() {
            Some(dir) => PrebakedCatalog::load(&dir)?,
            None => PrebakedCatalog::default(),
        };

        let mut settings = toml.launch_settings();
        settings.log_dir = config.tool_log_dir();
        if let Some(dir) = config.recipe_dir() {
            settings.recipe_files = discover_recipes(&dir, Some(&toml.tool.recipe_exclude))?;
        }

        let live_ports: Vec<u16> = registry.list().await?.iter().map(|s| s.port).collect();
        let (min, max) = toml.port_range();
        let mut ports = PortAllocator::from_live_ports(min, max, live_ports)?;
        if toml.ports.skip_bound {
            ports = ports.with_bound_check(is_port_bound);
        }

        let manager = Arc::new(Self::with_allocator(
            registry,
            ports,
            catalog,
            Arc::new(OsProcessDriver::new(settings)),
            Arc::new(SystemClock),
            toml.grace_period(),
        ));
        let pruned = manager
            .reconcile()
            .await
            .context("Failed to reconcile registry with running processes")?;
        Ok((manager, pruned))
    }

    pub fn catalog(&self) -> &PrebakedCatalog {
        &self.catalog
    }

    pub async fn port_range(&self) -> (u16, u16) {
        self.state.lock().await.ports.range()
    }

    /// Ports neither recorded in the registry nor claimed by in-flight work.
    pub async fn free_ports(&self) -> Result<usize, ProgenyError> {
        let mut state = self.state.lock().await;
        let live = self.registry.list().await?;
        state.resync(&live);
        Ok(state.ports.available())
    }

    // ── Spin ──────────────────────────────────────────────────────────

    /// Allocate a port, launch an instance and record it.
    ///
    /// All-or-nothing: a failed launch releases the port, and a failed
    /// registry write kills the fresh process before releasing the port.
    pub async fn spin(&self, request: SpinRequest) -> Result<SpinOutcome, ProgenyError> {
        validate_name("username", &request.username)?;
        let base_name = request
            .session_name
            .clone()
            .unwrap_or_else(|| request.username.clone());
        validate_name("session_name", &base_name)?;

        // Input validation happens before any resource is touched.
        let resolved = request.spec.resolve(&self.catalog)?;

        let (port, session_name) = {
            let mut state = self.state.lock().await;
            let live = self.registry.list().await?;
            state.resync(&live);
            let live_names: HashSet<&str> = live.iter().map(|s| s.session_name.as_str()).collect();
            let session_name = derive_session_name(&base_name, request.uniquify, |name| {
                live_names.contains(name) || state.name_pending(name)
            })?;
            let port = state.ports.allocate()?;
            state.pending.insert(port, session_name.clone());
            (port, session_name)
        };

        let mut config = resolved.config;
        config.insert("port".to_string(), serde_json::Value::from(port));
        let launch = LaunchRequest {
            session_name: session_name.clone(),
            port,
            args: resolved.args,
            config,
        };
        let command_line = self.driver.command_line(&launch);

        let pid = match self.driver.launch(&launch).await {
            Ok(pid) => pid,
            Err(e) => {
                warn!(session = %session_name, port, error = %e, "Launch failed, releasing port");
                self.abandon(port).await;
                return Err(e);
            }
        };

        let session = Session {
            port,
            session_name: session_name.clone(),
            username: request.username.clone(),
            command: command_line,
            pid,
            started_at: self.clock.now(),
        };

        let inserted = {
            let mut state = self.state.lock().await;
            let result = self.registry.insert(session.clone()).await;
            state.pending.remove(&port);
            result
        };

        if let Err(e) = inserted {
            error!(session = %session_name, port, pid, error = %e, "Registry write failed, killing instance");
            if let Err(kill_err) = self.driver.terminate(pid, self.grace_period).await {
                error!(pid, error = %kill_err, "Rollback could not terminate instance");
            }
            self.state.lock().await.ports.release(port);
            return Err(e);
        }

        info!(
            username = %request.username,
            session = %session_name,
            port,
            pid,
            "Spun instance"
        );
        Ok(SpinOutcome { port, session_name })
    }

    async fn abandon(&self, port: u16) {
        let mut state = self.state.lock().await;
        state.ports.release(port);
        state.pending.remove(&port);
    }

    // ── Lookup ────────────────────────────────────────────────────────

    pub async fn lookup(&self, selector: &Selector) -> Result<Vec<Session>, ProgenyError> {
        self.registry.find(selector.to_filter(self.clock.now())).await
    }

    /// Every live session, ordered by port.
    pub async fn list(&self) -> Result<Vec<Session>, ProgenyError> {
        self.registry.list().await
    }

    // ── Cleanup ───────────────────────────────────────────────────────

    /// Terminate every session matching `selector`, then drop its row and
    /// release its port. Returns the sessions that were cleaned up.
    ///
    /// A process that is already gone counts as cleaned up. A process that
    /// could not be signalled keeps its row and port.
    pub async fn cleanup(&self, selector: &Selector) -> Result<Vec<Session>, ProgenyError> {
        let filter = selector.to_filter(self.clock.now());
        self.cleanup_filter(filter, &selector.to_string()).await
    }

    /// Terminate every live session. Used on shutdown only.
    pub async fn cleanup_all(&self) -> Result<Vec<Session>, ProgenyError> {
        let mut cleaned = Vec::new();
        for session in self.registry.list().await? {
            cleaned.extend(
                self.cleanup_filter(RowFilter::Port(session.port), "all")
                    .await?,
            );
        }
        Ok(cleaned)
    }

    async fn cleanup_filter(
        &self,
        filter: RowFilter,
        label: &str,
    ) -> Result<Vec<Session>, ProgenyError> {
        let targets: Vec<Session> = {
            let mut state = self.state.lock().await;
            self.registry
                .find(filter)
                .await?
                .into_iter()
                .filter(|session| state.terminating.insert(session.port))
                .collect()
        };
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let outcomes = join_all(
            targets
                .iter()
                .map(|session| self.driver.terminate(session.pid, self.grace_period)),
        )
        .await;

        let mut state = self.state.lock().await;
        let mut cleaned = Vec::new();
        let mut first_error = None;
        for (session, outcome) in targets.into_iter().zip(outcomes) {
            state.terminating.remove(&session.port);
            let termination = match outcome {
                Ok(termination) => termination,
                Err(e) => {
                    error!(session = %session.session_name, pid = session.pid, error = %e, "Failed to terminate instance");
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            if let Err(e) = self.registry.remove(RowFilter::Port(session.port)).await {
                error!(session = %session.session_name, port = session.port, error = %e, "Failed to remove registry row");
                first_error.get_or_insert(e);
                continue;
            }
            state.ports.release(session.port);
            match termination {
                Termination::AlreadyDead => warn!(
                    session = %session.session_name,
                    port = session.port,
                    pid = session.pid,
                    "Removed stale session whose process was already gone"
                ),
                Termination::Exited | Termination::Killed => info!(
                    session = %session.session_name,
                    port = session.port,
                    pid = session.pid,
                    ?termination,
                    selector = %label,
                    "Terminated instance"
                ),
            }
            cleaned.push(session);
        }

        match first_error {
            Some(e) if cleaned.is_empty() => Err(e),
            _ => Ok(cleaned),
        }
    }

    // ── Startup ───────────────────────────────────────────────────────

    /// Drop rows whose process died while nobody was watching.
    /// Goes through ordinary cleanup, where a dead process is a no-op termination.
    pub async fn reconcile(&self) -> Result<Vec<Session>, ProgenyError> {
        let mut pruned = Vec::new();
        for session in self.registry.list().await? {
            if self.driver.is_alive(session.pid) {
                continue;
            }
            pruned.extend(self.cleanup(&Selector::Port(session.port)).await?);
        }
        if !pruned.is_empty() {
            info!(count = pruned.len(), "Pruned stale sessions on startup");
        }
        Ok(pruned)
    }
}

/// Pick `base`, or with `uniquify` the first free `base-N` for N >= 2.
pub fn derive_session_name(
    base: &str,
    uniquify: bool,
    taken: impl Fn(&str) -> bool,
) -> Result<String, ProgenyError> {
    if !taken(base) {
        return Ok(base.to_string());
    }
    if !uniquify {
        return Err(ProgenyError::SessionNameConflict {
            name: base.to_string(),
        });
    }
    (2u32..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !taken(candidate))
        .ok_or_else(|| ProgenyError::SessionNameConflict {
            name: base.to_string(),
        })
}
