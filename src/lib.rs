//! Embeddable intercepting HTTP/HTTPS forwarding proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────────────────┐
//!                  │                    INTERCEPT PROXY                        │
//!   Client         │  ┌─────────┐   ┌──────────┐   ┌───────────┐   ┌──────┐   │
//!   ──────────────▶│─▶│   net   │──▶│  proxy   │──▶│   pool    │──▶│origin│───┼──▶ Origin
//!                  │  │listener │   │ inbound  │   │  manager  │   │ conn │   │
//!                  │  └─────────┘   └────┬─────┘   └───────────┘   └──┬───┘   │
//!                  │                     │ mirror → request transform  │       │
//!                  │                     │                             │       │
//!   ◀──────────────│◀──── response transform ◀── bridge (events) ◀─────┘       │
//!                  │                     │                                     │
//!                  │            CONNECT  ▼                                     │
//!                  │             tunnel (200, TLS accept, reclaim) ──┐         │
//!                  │                     ▲                           │         │
//!                  │                     └── decrypted stream ◀──────┘         │
//!                  └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Parsed heads drive decisions; transforms see and rewrite the raw mirrored
//! bytes. Everything observable is published as a [`ProxyEvent`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod hooks;
pub mod http;
pub mod lifecycle;
pub mod mirror;
pub mod net;
pub mod observability;
pub mod pool;
pub mod proxy;
pub mod transform;
pub mod tunnel;

pub use config::ProxyConfig;
pub use error::{ProxyError, TransformError};
pub use events::{EventKind, ProxyEvent};
pub use hooks::{ClientTlsOptions, ProxyHooks, ServerOptions};
pub use lifecycle::Shutdown;
pub use proxy::Proxy;
pub use transform::{BoxTransform, Identity, Replace, Transform};
