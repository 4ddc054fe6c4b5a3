//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `serve`         | `Serve`                                            |
//! | `session`       | `Spin`, `Cleanup`, `List`, `Reconcile`             |
//! | `prebaked`      | `Prebaked`                                         |
//! | `config`        | `Config`                                           |

pub mod config;
pub mod prebaked;
pub mod serve;
pub mod session;

pub use config::cmd_config;
pub use prebaked::cmd_prebaked;
pub use serve::cmd_serve;
pub use session::{cmd_cleanup, cmd_list, cmd_reconcile, cmd_spin};
