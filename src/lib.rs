//! svcmgr - Non-root process supervisor
//!
//! A Rust implementation that:
//! - Starts, stops and monitors user-defined services
//! - Restarts crashed services with a bounded crash-loop backoff
//! - Follows services that daemonize themselves through a PID file
//! - Is controlled over a line-delimited JSON Unix socket
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                     svcmgrd                      │
//! ├─────────────────────────────────────────────────┤
//! │  Reactor (poll)  │  Request handler │  Signals  │
//! ├─────────────────────────────────────────────────┤
//! │        Service Manager  +  Process supervisor    │
//! ├─────────────────────────────────────────────────┤
//! │   Definitions    │  Resource limits │  Config   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Everything the daemon does happens on one thread; the signal handler
//! only writes to atomics.

pub mod client;
pub mod config;
pub mod daemon;
pub mod limits;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod units;

pub use config::{Paths, SupervisorPolicy};
pub use manager::{ListStatus, Manager, ManagerError};
pub use units::ServiceConfig;
