//! UDS transport for the authkeeper password authority.
//!
//! The daemon binds four Unix stream sockets — check, set, reset, policy —
//! and feeds length-prefixed frames into the synchronous
//! [`RequestProcessor`](authkeeper_core::RequestProcessor) under a
//! process-wide lock. Peer identity for the check and set endpoints comes
//! from `SO_PEERCRED`; the reset and policy sockets are instead protected
//! by their file modes, which restrict connections to the service account.
//!
//! # Connection Lifecycle
//!
//! ```text
//! accept ──▶ resolve peer credentials ──▶ read frame ──▶ process ──▶ reply
//!                                              ▲                      │
//!                                              └──────────────────────┘
//! ```
//!
//! A malformed frame (oversized, truncated body, unknown header) closes the
//! connection; operation failures are replied with a status code and the
//! connection stays open for the next request.

pub mod config;
pub mod credentials;
pub mod framing;
pub mod server;

pub use config::DaemonConfig;
pub use server::Server;
