//! Client library for the authkeeper daemon.
//!
//! Blocking, stateless per request: connect to the endpoint socket, send
//! one framed request, read one framed reply, close. The daemon's retry
//! ignore period makes request batching pointless for interactive tools,
//! so the simple model costs nothing.

pub mod client;

pub use client::{CheckReport, Client, ClientError};
