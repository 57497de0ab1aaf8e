//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → owned by the Proxy instance
//! ```
//!
//! # Design Decisions
//! - Config is immutable once the proxy is built
//! - All fields have defaults to allow minimal configs
//! - Code-level hooks (transforms, TLS options) live in `crate::hooks`

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ListenerConfig, LogFormat, ObservabilityConfig, ProxyConfig, TimeoutConfig, TlsConfig,
};
pub use validation::{validate_config, ValidationError};
