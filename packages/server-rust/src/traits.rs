use async_trait::async_trait;
use pgscope_core::Context;
use tokio::net::TcpStream;

use crate::session::{ErrorResponse, PreparedStatements};

/// Wire-protocol implementation for one accepted connection.
///
/// The context already carries the remote address and is cancelled when the
/// connection is dropped or the server shuts down.
#[async_trait]
pub trait ConnectionDriver: Send + Sync {
    /// Runs the protocol until the client disconnects.
    async fn drive(&self, ctx: Context, stream: TcpStream) -> anyhow::Result<()>;
}

/// Parses and plans a query in the scope of a session.
///
/// Metadata (type map, parameters, remote address) is read from `ctx`; the
/// handler never receives it through any other path.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn prepare(&self, ctx: &Context, query: &str) -> anyhow::Result<PreparedStatements>;
}

/// Turns a handler error into a client-facing error response.
///
/// Receives the same context the failing handler saw, so the response can be
/// attributed to the originating connection.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, ctx: &Context, err: &anyhow::Error) -> ErrorResponse;
}
