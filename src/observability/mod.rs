//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape, binary only)
//! ```
//!
//! # Design Decisions
//! - Structured fields (connection_id, transaction_id, destination) on every
//!   log line that concerns one connection
//! - Metrics are cheap (atomic increments) and no-ops until a recorder is
//!   installed, so the library never requires an exporter

pub mod logging;
pub mod metrics;
