//! Listener and per-connection settings.

use std::time::Duration;

/// Where the server listens and how long connections may take.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    pub connection: ConnectionConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5432,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Timeouts applied to every accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Accept-to-startup-packet limit.
    pub handshake_timeout: Duration,
    /// A session with no client message for this long is closed.
    pub idle_timeout: Duration,
    /// Upper bound on waiting for in-flight queries at shutdown.
    pub drain_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(30),
        }
    }
}
