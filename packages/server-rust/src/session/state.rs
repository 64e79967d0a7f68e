//! Per-connection session: runtime parameter updates and query dispatch.
//!
//! A session owns the connection's *current* context. Parameter updates
//! derive a new context and swap it in; queries run against a clone taken at
//! dispatch time, so a handler never observes an update made after it
//! started.

use std::sync::Arc;

use metrics::counter;
use pgscope_core::{Context, ContextError, ParameterStatus, Parameters};
use tracing::{debug, warn};

use super::classify::ErrorResponse;
use super::statement::PreparedStatements;
use crate::network::ShutdownController;
use crate::traits::{ErrorClassifier, QueryHandler};

/// Parameters reported by the server that clients may not change.
const READ_ONLY: [ParameterStatus; 3] = [
    ParameterStatus::SERVER_VERSION,
    ParameterStatus::SERVER_ENCODING,
    ParameterStatus::IS_SUPERUSER,
];

/// Client parameters the server echoes back in its own parameter set.
const REPORTED: [ParameterStatus; 3] = [
    ParameterStatus::APPLICATION_NAME,
    ParameterStatus::CLIENT_ENCODING,
    ParameterStatus::SESSION_AUTHORIZATION,
];

/// Whether `status` is owned by the server and never taken from the client.
#[must_use]
pub fn is_server_owned(status: &str) -> bool {
    READ_ONLY.iter().any(|s| s.as_str() == status)
}

/// Errors from session-level operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session closed: {0}")]
    Closed(#[from] ContextError),
    #[error("parameter \"{0}\" cannot be changed")]
    ReadOnlyParameter(ParameterStatus),
}

/// Result of a successful [`Session::set_parameter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterChange {
    pub status: ParameterStatus,
    pub value: String,
    /// Whether the server parameter set changed too, i.e. a
    /// `ParameterStatus` message is owed to the client.
    pub reported: bool,
}

/// One connection's handling flow after the startup handshake.
#[derive(Debug)]
pub struct Session {
    /// Context the session started with; updates are layered on top of it so
    /// the chain does not grow with every `SET`.
    base: Context,
    ctx: Context,
    shutdown: Arc<ShutdownController>,
}

impl Session {
    /// Starts a session on a context produced by the handshake.
    #[must_use]
    pub fn new(ctx: Context, shutdown: Arc<ShutdownController>) -> Self {
        Self {
            base: ctx.clone(),
            ctx,
            shutdown,
        }
    }

    /// Snapshot of the current context.
    #[must_use]
    pub fn context(&self) -> Context {
        self.ctx.clone()
    }

    /// Applies a runtime parameter update (`SET name = value`).
    ///
    /// The current client set is read, unioned with the update, and
    /// re-attached, so unrelated parameters survive. Contexts handed out
    /// earlier keep the old values.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Closed`] if the session's context is done
    /// - [`SessionError::ReadOnlyParameter`] for server-owned parameters
    pub fn set_parameter(
        &mut self,
        status: impl Into<ParameterStatus>,
        value: impl Into<String>,
    ) -> Result<ParameterChange, SessionError> {
        self.ctx.check()?;

        let status = status.into();
        let value = value.into();
        if READ_ONLY.contains(&status) {
            return Err(SessionError::ReadOnlyParameter(status));
        }

        let update = Parameters::new().with(status.clone(), value.clone());
        let client = self
            .ctx
            .client_parameters()
            .cloned()
            .unwrap_or_default()
            .merged(&update);

        let reported = REPORTED.contains(&status);
        let server = self.ctx.server_parameters().cloned();
        let server = if reported {
            Some(server.unwrap_or_default().merged(&update))
        } else {
            server
        };

        debug!(parameter = %status, value = %value, reported, "session parameter updated");
        self.ctx = self
            .base
            .with_client_parameters(client)
            .with_server_parameters(server);
        Ok(ParameterChange {
            status,
            value,
            reported,
        })
    }

    /// Runs `handler` against a snapshot of the current context.
    ///
    /// The handler is raced against the context's cancellation. Any error,
    /// including cancellation, goes to `classifier` together with the same
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns the classified [`ErrorResponse`] when the handler fails or the
    /// context is done.
    pub async fn execute<H, C>(
        &self,
        handler: &H,
        classifier: &C,
        query: &str,
    ) -> Result<PreparedStatements, ErrorResponse>
    where
        H: QueryHandler + ?Sized,
        C: ErrorClassifier + ?Sized,
    {
        let ctx = self.context();
        counter!("pgscope_queries_total").increment(1);

        let result = match ctx.check() {
            Err(reason) => Err(anyhow::Error::new(reason)),
            Ok(()) => {
                let _guard = self.shutdown.in_flight_guard();
                tokio::select! {
                    res = handler.prepare(&ctx, query) => res,
                    reason = ctx.done() => Err(anyhow::Error::new(reason)),
                }
            }
        };

        result.map_err(|err| {
            let response = classifier.classify(&ctx, &err);
            counter!("pgscope_query_errors_total", "severity" => response.severity.as_str())
                .increment(1);
            warn!(
                code = %response.code,
                severity = %response.severity,
                remote = ?response.remote_addr,
                "query failed: {}",
                response.message
            );
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use async_trait::async_trait;
    use pgscope_core::{RemoteAddr, TypeMap};
    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::session::classify::{DefaultClassifier, QueryError, SqlState};
    use crate::session::statement::{Column, PreparedStatement};

    /// Reads metadata from the context it is handed and reports it back.
    struct ProbeHandler {
        seen: mpsc::UnboundedSender<Context>,
    }

    #[async_trait]
    impl QueryHandler for ProbeHandler {
        async fn prepare(&self, ctx: &Context, query: &str) -> anyhow::Result<PreparedStatements> {
            let _ = self.seen.send(ctx.clone());
            if query.starts_with("FAIL") {
                return Err(QueryError::syntax("bad query").into());
            }
            let types = ctx
                .type_map()
                .ok_or_else(|| anyhow::anyhow!("no type map negotiated"))?;
            Ok(vec![PreparedStatement::new(query)
                .with_columns(vec![Column::new("?column?", 23, &types)])])
        }
    }

    /// Blocks until released, so tests can hold a query in flight.
    struct GateHandler {
        started: mpsc::UnboundedSender<Context>,
        release: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl QueryHandler for GateHandler {
        async fn prepare(&self, ctx: &Context, query: &str) -> anyhow::Result<PreparedStatements> {
            let _ = self.started.send(ctx.clone());
            let rx = self.release.lock().await.take();
            if let Some(rx) = rx {
                let _ = rx.await;
            } else {
                std::future::pending::<()>().await;
            }
            Ok(vec![PreparedStatement::new(query)])
        }
    }

    fn handshaken_ctx(root: &Context) -> Context {
        let addr: SocketAddr = "198.51.100.7:54321".parse().unwrap();
        root.with_remote_addr(RemoteAddr::Tcp(addr))
            .with_type_map(Arc::new(TypeMap::postgres_defaults()))
            .with_client_parameters(
                Parameters::new()
                    .with(ParameterStatus::USER, "alice")
                    .with(ParameterStatus::APPLICATION_NAME, "psql"),
            )
            .with_server_parameters(
                Parameters::new()
                    .with(ParameterStatus::SERVER_VERSION, "15.2")
                    .with(ParameterStatus::SERVER_ENCODING, "UTF8")
                    .with(ParameterStatus::APPLICATION_NAME, "psql"),
            )
    }

    fn session() -> (Session, Arc<ShutdownController>) {
        let shutdown = Arc::new(ShutdownController::new());
        let ctx = handshaken_ctx(shutdown.root());
        (Session::new(ctx, Arc::clone(&shutdown)), shutdown)
    }

    #[test]
    fn set_parameter_merges_into_client_set() {
        let (mut session, _) = session();
        let change = session
            .set_parameter(ParameterStatus::new("DateStyle"), "ISO, MDY")
            .unwrap();
        assert!(!change.reported);

        let ctx = session.context();
        let client = ctx.client_parameters().unwrap();
        assert_eq!(client.get("DateStyle"), Some("ISO, MDY"));
        assert_eq!(client.get("user"), Some("alice"));
        // Server set untouched for unreported parameters.
        assert!(ctx.server_parameters().unwrap().get("DateStyle").is_none());
    }

    #[test]
    fn reported_parameter_updates_server_set() {
        let (mut session, _) = session();
        let change = session
            .set_parameter(ParameterStatus::APPLICATION_NAME, "worker")
            .unwrap();
        assert!(change.reported);

        let ctx = session.context();
        assert_eq!(
            ctx.server_parameters().unwrap().get("application_name"),
            Some("worker")
        );
        assert_eq!(ctx.server_parameters().unwrap().get("server_version"), Some("15.2"));
    }

    #[test]
    fn repeated_updates_keep_latest_value_and_base_metadata() {
        let (mut session, _) = session();
        for i in 0..1_000 {
            session
                .set_parameter(ParameterStatus::APPLICATION_NAME, format!("app-{i}"))
                .unwrap();
        }
        let ctx = session.context();
        assert_eq!(
            ctx.client_parameters().unwrap().get("application_name"),
            Some("app-999")
        );
        assert_eq!(ctx.client_parameters().unwrap().get("user"), Some("alice"));
        assert!(ctx.type_map().is_some());
        assert!(ctx.remote_addr().is_some());
    }

    #[test]
    fn session_authorization_update_is_reported() {
        let (mut session, _) = session();
        let change = session
            .set_parameter(ParameterStatus::SESSION_AUTHORIZATION, "bob")
            .unwrap();
        assert!(change.reported);

        let ctx = session.context();
        assert_eq!(
            ctx.server_parameters().unwrap().get("session_authorization"),
            Some("bob")
        );
        assert_eq!(
            ctx.client_parameters().unwrap().get("session_authorization"),
            Some("bob")
        );
    }

    #[test]
    fn update_without_server_set_leaves_it_absent() {
        let shutdown = Arc::new(ShutdownController::new());
        let ctx = shutdown
            .root()
            .with_client_parameters(Parameters::new().with(ParameterStatus::USER, "alice"));
        let mut session = Session::new(ctx, shutdown);

        session.set_parameter(ParameterStatus::new("search_path"), "public").unwrap();
        assert!(session.context().server_parameters().is_none());
    }

    #[test]
    fn server_owned_tags() {
        assert!(is_server_owned("server_version"));
        assert!(is_server_owned("is_superuser"));
        assert!(!is_server_owned("application_name"));
    }

    #[test]
    fn read_only_parameters_are_rejected() {
        let (mut session, _) = session();
        let before = session.context();
        let err = session
            .set_parameter(ParameterStatus::SERVER_VERSION, "99")
            .unwrap_err();
        assert_eq!(err, SessionError::ReadOnlyParameter(ParameterStatus::SERVER_VERSION));
        assert!(session.context().ptr_eq(&before));
    }

    #[test]
    fn set_parameter_after_shutdown_fails() {
        let (mut session, shutdown) = session();
        shutdown.trigger_shutdown();
        let err = session
            .set_parameter(ParameterStatus::APPLICATION_NAME, "late")
            .unwrap_err();
        assert_eq!(err, SessionError::Closed(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn handler_reads_metadata_from_context() {
        let (session, _) = session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = ProbeHandler { seen: tx };

        let stmts = session
            .execute(&handler, &DefaultClassifier, "SELECT 1")
            .await
            .unwrap();
        assert_eq!(stmts[0].columns[0].type_oid, 23);

        let seen = rx.recv().await.unwrap();
        assert_eq!(
            seen.server_parameters().unwrap().get("server_version"),
            Some("15.2")
        );
        assert_eq!(
            seen.remote_addr().map(ToString::to_string).as_deref(),
            Some("198.51.100.7:54321")
        );
    }

    #[tokio::test]
    async fn handler_error_is_classified_with_session_context() {
        let (session, _) = session();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = ProbeHandler { seen: tx };

        let err = session
            .execute(&handler, &DefaultClassifier, "FAIL now")
            .await
            .unwrap_err();
        assert_eq!(err.code, SqlState::SYNTAX_ERROR);
        assert_eq!(err.remote_addr.as_deref(), Some("198.51.100.7:54321"));
        assert_eq!(err.application_name.as_deref(), Some("psql"));
    }

    #[tokio::test]
    async fn running_query_keeps_its_snapshot_across_updates() {
        let (mut session, _) = session();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = oneshot::channel();
        let handler = Arc::new(GateHandler {
            started: started_tx,
            release: tokio::sync::Mutex::new(Some(release_rx)),
        });

        let old_ctx = session.context();
        let query = {
            let handler = Arc::clone(&handler);
            let snapshot = Session::new(old_ctx.clone(), Arc::clone(&session.shutdown));
            tokio::spawn(async move {
                snapshot
                    .execute(handler.as_ref(), &DefaultClassifier, "SELECT pg_sleep(1)")
                    .await
            })
        };
        let seen = started_rx.recv().await.unwrap();

        session
            .set_parameter(ParameterStatus::APPLICATION_NAME, "renamed")
            .unwrap();

        assert_eq!(
            seen.client_parameters().unwrap().get("application_name"),
            Some("psql")
        );
        assert_eq!(
            session.context().client_parameters().unwrap().get("application_name"),
            Some("renamed")
        );

        release_tx.send(()).unwrap();
        assert!(query.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_query() {
        let (session, shutdown) = session();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(GateHandler {
            started: started_tx,
            release: tokio::sync::Mutex::new(None),
        });

        let session = Arc::new(session);
        let query = {
            let session = Arc::clone(&session);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                session
                    .execute(handler.as_ref(), &DefaultClassifier, "SELECT forever")
                    .await
            })
        };
        started_rx.recv().await.unwrap();
        assert_eq!(shutdown.in_flight_count(), 1);

        shutdown.trigger_shutdown();

        let err = tokio::time::timeout(Duration::from_secs(2), query)
            .await
            .expect("query should stop after shutdown")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code, SqlState::QUERY_CANCELED);
        assert_eq!(shutdown.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_session_rejects_new_queries_without_running_handler() {
        let (session, shutdown) = session();
        shutdown.trigger_shutdown();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = ProbeHandler { seen: tx };

        let err = session
            .execute(&handler, &DefaultClassifier, "SELECT 1")
            .await
            .unwrap_err();
        assert_eq!(err.code, SqlState::QUERY_CANCELED);
        assert!(rx.try_recv().is_err());
    }
}
