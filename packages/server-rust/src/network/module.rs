//! Network module with deferred startup lifecycle.
//!
//! `new()` creates resources, `start()` binds the TCP listener, and `serve()`
//! starts accepting connections. Between `start()` and `serve()` the caller
//! can wire the registry and shutdown controller into other components.

use std::future::Future;
use std::sync::Arc;

use metrics::{counter, gauge};
use pgscope_core::RemoteAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::config::NetworkConfig;
use super::connection::ConnectionRegistry;
use super::shutdown::ShutdownController;
use crate::traits::ConnectionDriver;

/// Manages the TCP accept loop and connection lifecycle.
///
/// 1. `new()` -- allocates shared state (registry, shutdown controller)
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- accepts connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            listener: None,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Returns a shared reference to the connection registry.
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which differs from the configured one
    /// when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Accepts connections until `shutdown` resolves, then drains.
    ///
    /// Every accepted socket gets its own cancellation scope derived from the
    /// server root, with the peer address attached, and is handed to
    /// `driver` on a separate task.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first.
    pub async fn serve<D>(
        self,
        driver: Arc<D>,
        shutdown: impl Future<Output = ()> + Send,
    ) -> anyhow::Result<()>
    where
        D: ConnectionDriver + 'static,
    {
        let Some(listener) = self.listener else {
            anyhow::bail!("start() must be called before serve()");
        };
        let registry = self.registry;
        let shutdown_ctrl = self.shutdown;

        shutdown_ctrl.mark_accepting();
        info!("accepting connections");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => spawn_connection(
                        stream,
                        RemoteAddr::Tcp(peer),
                        &registry,
                        &shutdown_ctrl,
                        Arc::clone(&driver),
                    ),
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }

        drain_connections(&registry, &shutdown_ctrl, &self.config).await;
        Ok(())
    }
}

fn spawn_connection<D>(
    stream: TcpStream,
    remote_addr: RemoteAddr,
    registry: &Arc<ConnectionRegistry>,
    shutdown_ctrl: &ShutdownController,
    driver: Arc<D>,
) where
    D: ConnectionDriver + 'static,
{
    let handle = registry.register(shutdown_ctrl.root(), remote_addr);
    let registry = Arc::clone(registry);

    counter!("pgscope_connections_accepted_total").increment(1);
    gauge!("pgscope_connections_active").increment(1.0);
    info!(conn = handle.id.0, remote = %handle.remote_addr, "connection accepted");

    tokio::spawn(async move {
        let ctx = handle.context().clone();
        let outcome = tokio::select! {
            res = driver.drive(ctx.clone(), stream) => res,
            reason = ctx.done() => {
                debug!(conn = handle.id.0, "connection scope ended: {reason}");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            warn!(conn = handle.id.0, "connection error: {e:#}");
        }

        registry.remove(handle.id);
        handle.cancel();
        gauge!("pgscope_connections_active").decrement(1.0);
        info!(
            conn = handle.id.0,
            duration_ms = handle.connected_at.elapsed().as_millis(),
            "connection closed"
        );
    });
}

/// Cancels every connection, then waits for in-flight queries.
async fn drain_connections(
    registry: &ConnectionRegistry,
    shutdown_ctrl: &ShutdownController,
    config: &NetworkConfig,
) {
    shutdown_ctrl.trigger_shutdown();

    let handles = registry.drain_all();
    if !handles.is_empty() {
        info!("draining {} connections", handles.len());
    }

    let drained = shutdown_ctrl
        .wait_for_drain(config.connection.drain_timeout)
        .await;
    if drained {
        info!("all connections drained");
    } else {
        warn!("drain timeout expired with in-flight queries remaining");
    }
}
