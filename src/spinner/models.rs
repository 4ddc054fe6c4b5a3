use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ProgenyError;

/// One live tool instance as recorded in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub port: u16,
    pub session_name: String,
    pub username: String,
    /// Full command line the instance was launched with.
    pub command: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn url(&self, host: &str) -> String {
        session_url(host, self.port, &self.session_name)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.started_at
    }
}

/// Instances identify their session through a query parameter, not a path segment.
pub fn session_url(host: &str, port: u16, session_name: &str) -> String {
    format!("http://{}:{}/?session={}", host, port, session_name)
}

/// Returns an `InvalidName` error unless `value` is usable as a username or
/// session name. Names end up in URLs and environment variables, so only
/// `[A-Za-z0-9._@-]` is accepted.
pub fn validate_name(field: &'static str, value: &str) -> Result<(), ProgenyError> {
    if value.is_empty() {
        return Err(ProgenyError::InvalidName {
            field,
            value: value.to_string(),
            reason: "must not be empty",
        });
    }
    if value.len() > 128 {
        return Err(ProgenyError::InvalidName {
            field,
            value: value.to_string(),
            reason: "must be at most 128 characters",
        });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'))
    {
        return Err(ProgenyError::InvalidName {
            field,
            value: value.to_string(),
            reason: "may only contain letters, digits, '.', '_', '-' and '@'",
        });
    }
    Ok(())
}

/// Caller-facing selection of sessions for `lookup` and `cleanup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Port(u16),
    SessionName(String),
    Username(String),
    /// Sessions started strictly more than this long ago.
    OlderThan(Duration),
}

impl Selector {
    /// Resolve relative selectors against `now` so the registry sees a fixed cutoff.
    pub fn to_filter(&self, now: DateTime<Utc>) -> RowFilter {
        match self {
            Self::Port(port) => RowFilter::Port(*port),
            Self::SessionName(name) => RowFilter::SessionName(name.clone()),
            Self::Username(name) => RowFilter::Username(name.clone()),
            Self::OlderThan(age) => RowFilter::StartedBefore(
                now.checked_sub_signed(*age).unwrap_or(DateTime::<Utc>::MIN_UTC),
            ),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Port(port) => write!(f, "port={}", port),
            Self::SessionName(name) => write!(f, "session_name={}", name),
            Self::Username(name) => write!(f, "username={}", name),
            Self::OlderThan(age) => write!(f, "older_than={}s", age.num_seconds()),
        }
    }
}

/// Loosely-typed selector input as it arrives from query strings and CLI flags.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectorParts {
    pub port: Option<u16>,
    pub session_name: Option<String>,
    pub username: Option<String>,
    pub older_than_secs: Option<u64>,
}

impl SelectorParts {
    pub fn is_empty(&self) -> bool {
        self.given() == 0
    }

    fn given(&self) -> usize {
        [
            self.port.is_some(),
            self.session_name.is_some(),
            self.username.is_some(),
            self.older_than_secs.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    /// Exactly one field must be set.
    pub fn into_selector(self) -> Result<Selector, ProgenyError> {
        let given = self.given();
        if given != 1 {
            return Err(ProgenyError::AmbiguousSelector { given });
        }
        if let Some(port) = self.port {
            return Ok(Selector::Port(port));
        }
        if let Some(name) = self.session_name {
            return Ok(Selector::SessionName(name));
        }
        if let Some(name) = self.username {
            return Ok(Selector::Username(name));
        }
        match self.older_than_secs {
            // Ages beyond chrono's range clamp to the largest duration.
            Some(secs) => Ok(Selector::OlderThan(
                i64::try_from(secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .unwrap_or(Duration::MAX),
            )),
            None => Err(ProgenyError::AmbiguousSelector { given: 0 }),
        }
    }
}

/// Registry-level predicate, evaluated inside a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    Port(u16),
    SessionName(String),
    Username(String),
    StartedBefore(DateTime<Utc>),
}

/// Source of "now" for session timestamps and age computations.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used to drive timeout scenarios.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
