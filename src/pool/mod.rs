//! Connection pool adapter.
//!
//! # Data Flow
//! ```text
//! RequestHead
//!     → destination.rs (resolve host/port/scheme, apply server overrides)
//!     → manager.rs (idle lookup by key, stale check)
//!     → outbound.rs (connect + optional TLS when nothing idle)
//!     → transaction owns the connection (busy)
//!     → release / reclaim back to idle, or adopt / discard
//! ```
//!
//! # Design Decisions
//! - Pools belong to one proxy instance, never process-global
//! - Busy vs idle is ownership: idle connections sit in the map, a busy one
//!   is moved into exactly one transaction
//! - CONNECT tunnels hand their unused connection back with an explicit
//!   `reclaim` call instead of faking a protocol response

pub mod destination;
pub mod manager;
pub mod outbound;

pub use destination::{resolve, Destination, PoolKey, Scheme, TlsProfile};
pub use manager::{ConnectionPool, PoolStats};
pub use outbound::OutboundConnection;
