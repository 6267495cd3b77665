//! SSH agent multiplexer.
//!
//! Presents one OpenSSH agent socket to clients and forwards each request to
//! a set of upstream agents.
//!
//! # Architecture
//!
//! ```text
//!                                    ┌──► BackendConnection (read-target)
//! client ──► SshAgent ──► Multiplexer├──► BackendConnection (read-target)
//!  (UnixListener)          ▲         └──► BackendConnection (add-target) ──► selector
//!                          │
//! sshmuxd ── Reloader ─────┘  (swaps backends on config change)
//! ```
//!
//! # Routing
//!
//! - **List** fans out to add-targets, then read-targets; keys of healthy
//!   backends are served even when others fail.
//! - **Sign** and **remove** go to the first backend that reports the key.
//! - **Add** goes to the only add-target, or to the one the external
//!   `select_target_command` prints when there are several.
//! - **Lock**, **unlock** and **remove-all** are broadcast.
//! - **Extensions** are answered by the first backend that supports them.
//!
//! Each [`BackendConnection`] re-dials its upstream socket and retries a
//! failed call a bounded number of times before giving up.

pub mod backend;
pub mod connection;
pub mod error;
pub mod keyinfo;
pub mod mux;
pub mod reload;
pub mod session;

pub use backend::Backend;
pub use connection::{BackendConnection, Dialer, UnixDialer};
pub use error::{AggregateError, FanOut, MuxError};
pub use mux::Multiplexer;
pub use reload::{ReloadOutcome, Reloader};
pub use session::SshAgent;
