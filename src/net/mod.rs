//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking, close-all signal)
//!     → io.rs (erased into BoxedIo)
//!     → Hand off to the inbound pipeline
//!
//! CONNECT tunnel
//!     → io.rs (PrefixedIo replays bytes buffered behind the CONNECT head)
//!     → tls.rs (terminate client TLS with the configured identity)
//!     → Hand off to a fresh inbound pipeline
//!
//! Origin connection
//!     → tls.rs (optional TLS towards the origin)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked so it can be force-closed
//! - Plain TCP, TLS and TLS-in-tunnel share one boxed stream type

pub mod connection;
pub mod io;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use io::{BoxedIo, Io, PrefixedIo};
pub use listener::{ConnectionPermit, Listener};
pub use tls::{TlsConnectors, TlsIdentity};
