//! Typed error hierarchy for Progeny.
//!
//! `ProgenyError` covers every failure the spinner core can surface to a
//! caller. Variants map one-to-one onto the failure classes callers act on:
//! pool exhaustion, uniqueness conflicts, input validation, launch failures
//! and storage failures. CLI and HTTP layers wrap it in `anyhow` or translate
//! it into status codes respectively.

use thiserror::Error;

/// Errors from the spinner subsystem (allocator, registry, lifecycle manager).
#[derive(Debug, Error)]
pub enum ProgenyError {
    #[error("No free port in range {min}-{max}")]
    NoFreePort { min: u16, max: u16 },

    #[error("Port {port} is already held by a live session")]
    DuplicatePort { port: u16 },

    #[error("Session name '{name}' is already in use")]
    SessionNameConflict { name: String },

    #[error("Ambiguous command spec: {0}")]
    AmbiguousSpec(String),

    #[error("Incomplete command spec: {0}")]
    IncompleteSpec(String),

    #[error("Malformed command line: {0}")]
    MalformedCommand(String),

    #[error("Config key '{key}' is reserved and cannot be overridden")]
    ReservedConfigKey { key: String },

    #[error("Failed to launch session '{session_name}': {message}")]
    Launch {
        session_name: String,
        message: String,
    },

    #[error("Selector must name exactly one of port, session_name, username, older_than (got {given})")]
    AmbiguousSelector { given: usize },

    #[error("Invalid {field} '{value}': {reason}")]
    InvalidName {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Invalid port range {min}-{max}")]
    InvalidPortRange { min: u16, max: u16 },

    #[error("Failed to terminate process {pid}: {source}")]
    Termination {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry error: {0}")]
    Registry(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProgenyError {
    /// Stable machine-readable name of the variant, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoFreePort { .. } => "no_free_port",
            Self::DuplicatePort { .. } => "duplicate_port",
            Self::SessionNameConflict { .. } => "session_name_conflict",
            Self::AmbiguousSpec(_) => "ambiguous_spec",
            Self::IncompleteSpec(_) => "incomplete_spec",
            Self::MalformedCommand(_) => "malformed_command",
            Self::ReservedConfigKey { .. } => "reserved_config_key",
            Self::Launch { .. } => "launch",
            Self::AmbiguousSelector { .. } => "ambiguous_selector",
            Self::InvalidName { .. } => "invalid_name",
            Self::InvalidPortRange { .. } => "invalid_port_range",
            Self::Termination { .. } => "termination",
            Self::Registry(_) => "registry",
            Self::Other(_) => "internal",
        }
    }

    /// True for errors caused by caller input rather than system state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::AmbiguousSpec(_)
                | Self::IncompleteSpec(_)
                | Self::MalformedCommand(_)
                | Self::ReservedConfigKey { .. }
                | Self::AmbiguousSelector { .. }
                | Self::InvalidName { .. }
                | Self::InvalidPortRange { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_free_port_carries_range() {
        let err = ProgenyError::NoFreePort { min: 8000, max: 8002 };
        match &err {
            ProgenyError::NoFreePort { min, max } => {
                assert_eq!(*min, 8000);
                assert_eq!(*max, 8002);
            }
            _ => panic!("Expected NoFreePort"),
        }
        assert!(err.to_string().contains("8000-8002"));
    }

    #[test]
    fn launch_error_names_session() {
        let err = ProgenyError::Launch {
            session_name: "alice".into(),
            message: "exited with status 127".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("alice"));
        assert!(msg.contains("127"));
    }

    #[test]
    fn termination_error_keeps_io_source() {
        use std::error::Error as _;
        let err = ProgenyError::Termination {
            pid: 42,
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        let source = err.source().expect("source present");
        assert!(source.to_string().to_lowercase().contains("permission"));
    }

    #[test]
    fn validation_errors_are_classified() {
        assert!(ProgenyError::AmbiguousSpec("x".into()).is_validation());
        assert!(ProgenyError::MalformedCommand("x".into()).is_validation());
        assert!(ProgenyError::ReservedConfigKey { key: "port".into() }.is_validation());
        assert!(ProgenyError::AmbiguousSelector { given: 2 }.is_validation());
        assert!(!ProgenyError::NoFreePort { min: 1, max: 2 }.is_validation());
        assert!(!ProgenyError::DuplicatePort { port: 1 }.is_validation());
    }

    #[test]
    fn kinds_are_distinct_for_conflicts() {
        let dup = ProgenyError::DuplicatePort { port: 8000 };
        let name = ProgenyError::SessionNameConflict { name: "a".into() };
        assert_eq!(dup.kind(), "duplicate_port");
        assert_eq!(name.kind(), "session_name_conflict");
    }

    #[test]
    fn converts_from_anyhow() {
        let err: ProgenyError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, ProgenyError::Other(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
