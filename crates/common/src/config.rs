//! Common configuration types for Callgrid components.

use crate::secret::SecretString;
use serde::Deserialize;

/// Database configuration.
///
/// The connection URL embeds credentials, so it is held as a secret and
/// redacted from `Debug` output.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    pub url: SecretString,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub default_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}
