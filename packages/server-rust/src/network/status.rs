//! Point-in-time server status, for logs and probes.

use serde_json::{json, Value};

use super::connection::ConnectionRegistry;
use super::shutdown::ShutdownController;

/// Builds a JSON snapshot of health state, live connections, and in-flight
/// queries.
#[must_use]
pub fn status(registry: &ConnectionRegistry, shutdown: &ShutdownController) -> Value {
    json!({
        "state": shutdown.state().as_str(),
        "connections": registry.count(),
        "in_flight": shutdown.in_flight_count(),
    })
}
