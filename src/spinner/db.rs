use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::{RowFilter, Session};
use crate::errors::ProgenyError;

type RegistryResult<T> = std::result::Result<T, ProgenyError>;

fn storage<E>(context: &'static str) -> impl FnOnce(E) -> ProgenyError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |e| ProgenyError::Registry(anyhow::Error::new(e).context(context))
}

/// Async-safe handle to the process registry.
///
/// Wraps `ProcessRegistry` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so SQLite I/O never ties up
/// async worker threads. Every call runs against one connection under one
/// lock, which is what gives multi-row queries a consistent snapshot.
#[derive(Clone)]
pub struct RegistryHandle {
    inner: Arc<std::sync::Mutex<ProcessRegistry>>,
}

impl RegistryHandle {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(registry)),
        }
    }

    /// Run a closure with access to the registry on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> RegistryResult<R>
    where
        F: FnOnce(&ProcessRegistry) -> RegistryResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let registry = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = registry
                .lock()
                .map_err(|e| ProgenyError::Registry(anyhow!("Registry lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .context("Registry task panicked")?
    }

    pub async fn insert(&self, session: Session) -> RegistryResult<()> {
        self.call(move |db| db.insert(&session)).await
    }

    pub async fn find(&self, filter: RowFilter) -> RegistryResult<Vec<Session>> {
        self.call(move |db| db.find(&filter)).await
    }

    pub async fn remove(&self, filter: RowFilter) -> RegistryResult<Vec<Session>> {
        self.call(move |db| db.remove(&filter)).await
    }

    pub async fn list(&self) -> RegistryResult<Vec<Session>> {
        self.call(|db| db.list()).await
    }

    /// Acquire the registry mutex synchronously.
    #[cfg(test)]
    pub(crate) fn lock_sync(&self) -> RegistryResult<std::sync::MutexGuard<'_, ProcessRegistry>> {
        self.inner
            .lock()
            .map_err(|e| ProgenyError::Registry(anyhow!("Registry lock poisoned: {}", e)))
    }
}

/// Durable record of every live session, keyed by port.
pub struct ProcessRegistry {
    conn: Connection,
}

const SESSION_COLUMNS: &str = "port, session_name, username, command, pid, started_at";

impl ProcessRegistry {
    /// Open (or create) the registry at the given path and run migrations.
    pub fn open(path: &Path) -> RegistryResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create registry directory {}", parent.display()))
                .map_err(ProgenyError::Registry)?;
        }
        let conn = Connection::open(path).map_err(storage("Failed to open registry database"))?;
        // The CLI and a running server may share the file.
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(storage("Failed to set busy timeout"))?;
        let registry = Self { conn };
        registry.init()?;
        Ok(registry)
    }

    /// Create an in-memory registry (for testing).
    pub fn open_in_memory() -> RegistryResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(storage("Failed to open in-memory registry database"))?;
        let registry = Self { conn };
        registry.init()?;
        Ok(registry)
    }

    /// Flush and close the underlying connection.
    pub fn close(self) -> RegistryResult<()> {
        self.conn
            .close()
            .map_err(|(_, e)| storage("Failed to close registry database")(e))
    }

    fn init(&self) -> RegistryResult<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    port INTEGER PRIMARY KEY,
                    session_name TEXT NOT NULL UNIQUE,
                    username TEXT NOT NULL,
                    command TEXT NOT NULL,
                    pid INTEGER NOT NULL,
                    started_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_username ON sessions(username);
                CREATE INDEX IF NOT EXISTS idx_sessions_started_at ON sessions(started_at);
                ",
            )
            .map_err(storage("Failed to create sessions table"))
    }

    // ── Mutations ─────────────────────────────────────────────────────

    /// Record a new live session. Fails if its port or name is already recorded.
    pub fn insert(&self, session: &Session) -> RegistryResult<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(storage("Failed to begin insert transaction"))?;

        let port_taken: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM sessions WHERE port = ?1",
                params![session.port],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage("Failed to check port uniqueness"))?;
        if port_taken.is_some() {
            return Err(ProgenyError::DuplicatePort { port: session.port });
        }

        let name_taken: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM sessions WHERE session_name = ?1",
                params![session.session_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage("Failed to check session name uniqueness"))?;
        if name_taken.is_some() {
            return Err(ProgenyError::SessionNameConflict {
                name: session.session_name.clone(),
            });
        }

        tx.execute(
            "INSERT INTO sessions (port, session_name, username, command, pid, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.port,
                session.session_name,
                session.username,
                session.command,
                session.pid,
                session.started_at.timestamp_millis(),
            ],
        )
        .map_err(storage("Failed to insert session"))?;
        tx.commit().map_err(storage("Failed to commit session insert"))
    }

    /// Delete all rows matching `filter` and return them.
    /// Selection and deletion happen in one transaction.
    pub fn remove(&self, filter: &RowFilter) -> RegistryResult<Vec<Session>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(storage("Failed to begin remove transaction"))?;
        let (clause, value) = filter_clause(filter);
        let removed = query_sessions(&tx, clause, Some(value.clone()))?;
        tx.execute(&format!("DELETE FROM sessions WHERE {}", clause), [value])
            .map_err(storage("Failed to delete sessions"))?;
        tx.commit().map_err(storage("Failed to commit session removal"))?;
        Ok(removed)
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn find(&self, filter: &RowFilter) -> RegistryResult<Vec<Session>> {
        let (clause, value) = filter_clause(filter);
        query_sessions(&self.conn, clause, Some(value))
    }

    pub fn list(&self) -> RegistryResult<Vec<Session>> {
        query_sessions(&self.conn, "1 = 1", None)
    }
}

fn filter_clause(filter: &RowFilter) -> (&'static str, Value) {
    match filter {
        RowFilter::Port(port) => ("port = ?1", Value::Integer(i64::from(*port))),
        RowFilter::SessionName(name) => ("session_name = ?1", Value::Text(name.clone())),
        RowFilter::Username(name) => ("username = ?1", Value::Text(name.clone())),
        RowFilter::StartedBefore(cutoff) => {
            ("started_at < ?1", Value::Integer(cutoff.timestamp_millis()))
        }
    }
}

fn query_sessions(
    conn: &Connection,
    clause: &str,
    value: Option<Value>,
) -> RegistryResult<Vec<Session>> {
    let sql = format!(
        "SELECT {} FROM sessions WHERE {} ORDER BY port",
        SESSION_COLUMNS, clause
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(storage("Failed to prepare session query"))?;
    let params: Vec<Value> = value.into_iter().collect();
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), read_row)
        .map_err(storage("Failed to query sessions"))?;
    let mut sessions = Vec::new();
    for row in rows {
        let raw = row.map_err(storage("Failed to read session row"))?;
        sessions.push(raw.into_session()?);
    }
    Ok(sessions)
}

struct SessionRow {
    port: u16,
    session_name: String,
    username: String,
    command: String,
    pid: u32,
    started_at: i64,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        port: row.get(0)?,
        session_name: row.get(1)?,
        username: row.get(2)?,
        command: row.get(3)?,
        pid: row.get(4)?,
        started_at: row.get(5)?,
    })
}

impl SessionRow {
    fn into_session(self) -> RegistryResult<Session> {
        let started_at: DateTime<Utc> = DateTime::from_timestamp_millis(self.started_at)
            .ok_or_else(|| {
                ProgenyError::Registry(anyhow!(
                    "Invalid started_at {} for port {}",
                    self.started_at,
                    self.port
                ))
            })?;
        Ok(Session {
            port: self.port,
            session_name: self.session_name,
            username: self.username,
            command: self.command,
            pid: self.pid,
            started_at,
        })
    }
}
