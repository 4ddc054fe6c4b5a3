//! Spinner: port registry and lifecycle manager for annotation-tool instances.
//!
//! ## Overview
//!
//! Each user gets a private instance of the annotation tool (`prodigy` by
//! default) bound to a port from a fixed range. The spinner allocates the
//! port, launches the tool, records the session in a SQLite registry and
//! later terminates it on request or when it times out. The registry
//! survives restarts; on startup rows whose process is gone are pruned.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │ CLI/curl │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘          │         │                                        │
//!                       │         │ spin / lookup / cleanup                │
//!                       │         v                                        │
//!                       │  manager.rs  (LifecycleManager)  <── reaper.rs   │
//!                       │     │            │            │                  │
//!                       │     v            v            v                  │
//!                       │  ports.rs     db.rs       process.rs             │
//!                       │  (allocator)  (registry)  (ProcessDriver)        │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                             |
//! |------------|------------------------------------------------------------|
//! | `models`   | Shared types: `Session`, `Selector`, `RowFilter`, `Clock`  |
//! | `command`  | `CommandSpec` forms, argument vectors, reserved config keys|
//! | `prebaked` | YAML prebaked-project catalog and recipe file discovery    |
//! | `reaper`   | Periodic cleanup of sessions older than the timeout        |
//!
//! ## Spin Flow
//!
//! 1. Validate the username and session name, resolve the command spec
//!    (prebaked lookup, config merge, reserved-key check).
//! 2. Under the manager lock: resync the allocator from the registry, pick
//!    the session name and allocate a port.
//! 3. Without the lock: launch the tool with `port` injected into its config.
//! 4. Under the lock: write the registry row. A failed write kills the
//!    process; a failed launch releases the port.

pub mod api;
pub mod command;
pub mod db;
pub mod manager;
pub mod models;
pub mod ports;
pub mod prebaked;
pub mod process;
pub mod reaper;
pub mod server;
