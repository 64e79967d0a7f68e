//! Line-oriented demo protocol.
//!
//! Not `PostgreSQL` wire format: each message is one UTF-8 line, which makes
//! the server easy to poke at with `nc`. The first line is the startup
//! packet (`key=value` pairs separated by whitespace). After that:
//!
//! | client              | server                                  |
//! |---------------------|-----------------------------------------|
//! | `SET name = value`  | `S name=value` (if reported), `SET`     |
//! | `SHOW name`         | `V value`                               |
//! | `QUIT`              | `BYE`                                   |
//! | anything else       | `PREPARED <n>`                          |
//!
//! Errors are reported as `E <severity> <sqlstate> <message>`.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pgscope_core::{Context, ParameterStatus, Parameters, TypeMap};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info};

use crate::network::{ConnectionConfig, ShutdownController};
use crate::session::{
    is_server_owned, Column, ErrorResponse, Handshake, PreparedStatement, PreparedStatements,
    QueryError, Session, Severity, SqlState,
};
use crate::traits::{ConnectionDriver, ErrorClassifier, QueryHandler};

const MAX_LINE: usize = 8 * 1024;

/// [`ConnectionDriver`] speaking the line protocol described above.
pub struct LineDriver {
    handshake: Handshake,
    handler: Arc<dyn QueryHandler>,
    classifier: Arc<dyn ErrorClassifier>,
    shutdown: Arc<ShutdownController>,
    config: ConnectionConfig,
}

impl LineDriver {
    #[must_use]
    pub fn new(
        handshake: Handshake,
        handler: Arc<dyn QueryHandler>,
        classifier: Arc<dyn ErrorClassifier>,
        shutdown: Arc<ShutdownController>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            handshake,
            handler,
            classifier,
            shutdown,
            config,
        }
    }

    /// Runs one connection to completion over any byte stream.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, an over-long line, or a startup line
    /// that does not arrive within the handshake timeout.
    pub async fn run<S>(&self, ctx: Context, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));

        let Ok(first) = tokio::time::timeout(self.config.handshake_timeout, lines.next()).await
        else {
            anyhow::bail!("startup line not received within {:?}", self.config.handshake_timeout);
        };
        let Some(first) = first.transpose()? else {
            debug!("client closed before startup");
            return Ok(());
        };

        let startup = match parse_startup(&first) {
            Ok(startup) => startup,
            Err(err) => {
                let response = self.classifier.classify(&ctx, &anyhow::Error::new(err));
                lines.send(error_line(&response)).await?;
                return Ok(());
            }
        };

        let mut session = Session::new(
            self.handshake.complete(&ctx, startup),
            Arc::clone(&self.shutdown),
        );
        let negotiated = session.context();
        if let Some(server) = negotiated.server_parameters() {
            for line in status_lines(server) {
                lines.send(line).await?;
            }
        }
        lines.send("READY".to_string()).await?;

        loop {
            let Ok(next) = tokio::time::timeout(self.config.idle_timeout, lines.next()).await else {
                info!("closing idle connection");
                let msg = "E FATAL 57P05 terminating connection due to idle-session timeout";
                lines.send(msg.to_string()).await?;
                return Ok(());
            };
            let Some(line) = next.transpose()? else {
                return Ok(());
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let replies = match word.to_ascii_uppercase().as_str() {
                "QUIT" | "BYE" => {
                    lines.send("BYE".to_string()).await?;
                    return Ok(());
                }
                "SET" => self.set(&mut session, rest),
                "SHOW" => self.show(&session, rest).map(|value| vec![value]),
                _ => match session
                    .execute(self.handler.as_ref(), self.classifier.as_ref(), line)
                    .await
                {
                    Ok(stmts) => Ok(vec![format!("PREPARED {}", stmts.len())]),
                    Err(response) => Err(response),
                },
            };

            match replies {
                Ok(replies) => {
                    for reply in replies {
                        lines.send(reply).await?;
                    }
                }
                Err(response) => {
                    lines.send(error_line(&response)).await?;
                    if response.severity.terminates_session() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn set(&self, session: &mut Session, rest: &str) -> Result<Vec<String>, ErrorResponse> {
        let Some((name, value)) = parse_set(rest) else {
            let err = QueryError::syntax(format!("invalid SET syntax: {rest}"));
            return Err(self.classify(session, err));
        };
        match session.set_parameter(name.to_ascii_lowercase(), value) {
            Ok(change) if change.reported => Ok(vec![
                format!("S {}={}", change.status, change.value),
                "SET".to_string(),
            ]),
            Ok(_) => Ok(vec!["SET".to_string()]),
            Err(err) => Err(self.classify(session, err)),
        }
    }

    fn show(&self, session: &Session, rest: &str) -> Result<String, ErrorResponse> {
        let name = rest.trim().trim_end_matches(';').trim().to_ascii_lowercase();
        let ctx = session.context();
        let server = ctx.server_parameters().and_then(|p| p.get(&name));
        let value = if is_server_owned(&name) {
            server
        } else {
            ctx.client_parameters().and_then(|p| p.get(&name)).or(server)
        };
        match value {
            Some(value) => Ok(format!("V {value}")),
            None => Err(self.classify(
                session,
                QueryError::new(
                    SqlState::UNDEFINED_OBJECT,
                    format!("unrecognized configuration parameter \"{name}\""),
                ),
            )),
        }
    }

    fn classify(
        &self,
        session: &Session,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> ErrorResponse {
        self.classifier
            .classify(&session.context(), &anyhow::Error::new(err))
    }
}

#[async_trait]
impl ConnectionDriver for LineDriver {
    async fn drive(&self, ctx: Context, stream: TcpStream) -> anyhow::Result<()> {
        self.run(ctx, stream).await
    }
}

/// Minimal [`QueryHandler`]: splits on `;` and describes each statement
/// without executing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementSplitter;

#[async_trait]
impl QueryHandler for StatementSplitter {
    async fn prepare(&self, ctx: &Context, query: &str) -> anyhow::Result<PreparedStatements> {
        ctx.check()?;
        let types = ctx.type_map().unwrap_or_else(|| Arc::new(TypeMap::new()));

        let stmts: PreparedStatements = query
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                let params = vec![25; placeholder_count(s)];
                let columns = if s.get(..6).is_some_and(|w| w.eq_ignore_ascii_case("select")) {
                    vec![Column::new("?column?", 25, &types)]
                } else {
                    Vec::new()
                };
                PreparedStatement::new(s)
                    .with_parameters(params)
                    .with_columns(columns)
            })
            .collect();

        if stmts.is_empty() {
            return Err(QueryError::syntax("empty query").into());
        }
        Ok(stmts)
    }
}

/// Highest `$n` placeholder index in `stmt`, or 0 if there is none.
fn placeholder_count(stmt: &str) -> usize {
    stmt.split('$')
        .skip(1)
        .filter_map(|tail| {
            let end = tail
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(tail.len());
            tail[..end].parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

fn parse_startup(line: &str) -> Result<Parameters, QueryError> {
    line.split_whitespace()
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_ascii_lowercase(), v.to_string())),
            _ => Err(QueryError::new(
                SqlState::PROTOCOL_VIOLATION,
                format!("invalid startup parameter \"{pair}\""),
            )
            .with_severity(Severity::Fatal)),
        })
        .collect()
}

/// Accepts `name = value`, `name=value`, and `name TO value`.
fn parse_set(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.trim().trim_end_matches(';').trim();
    let end = rest.find(|c: char| c == '=' || c.is_whitespace())?;
    let (name, tail) = rest.split_at(end);
    let tail = tail.trim_start();
    let value = match tail.strip_prefix('=') {
        Some(value) => value,
        None => {
            let (to, value) = tail.split_once(char::is_whitespace)?;
            if !to.eq_ignore_ascii_case("to") {
                return None;
            }
            value
        }
    };
    let value = value.trim().trim_matches('\'');
    (!name.is_empty()).then_some((name, value))
}

fn status_lines(params: &Parameters) -> Vec<String> {
    let mut pairs: Vec<(&ParameterStatus, &String)> = params.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .into_iter()
        .map(|(status, value)| format!("S {status}={value}"))
        .collect()
}

fn error_line(response: &ErrorResponse) -> String {
    format!("E {} {} {}", response.severity, response.code, response.message)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use pgscope_core::RemoteAddr;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::session::{DefaultClassifier, SessionConfig};

    type Client = Framed<DuplexStream, LinesCodec>;

    fn driver(config: ConnectionConfig) -> Arc<LineDriver> {
        let handshake = Handshake::new(
            SessionConfig::default(),
            Arc::new(TypeMap::postgres_defaults()),
        );
        Arc::new(LineDriver::new(
            handshake,
            Arc::new(StatementSplitter),
            Arc::new(DefaultClassifier),
            Arc::new(ShutdownController::new()),
            config,
        ))
    }

    fn connect(config: ConnectionConfig) -> (Client, JoinHandle<anyhow::Result<()>>) {
        let (client, server) = tokio::io::duplex(4096);
        let driver = driver(config);
        let addr: SocketAddr = "198.51.100.7:54321".parse().unwrap();
        let ctx = Context::background().with_remote_addr(RemoteAddr::Tcp(addr));
        let task = tokio::spawn(async move { driver.run(ctx, server).await });
        (Framed::new(client, LinesCodec::new()), task)
    }

    async fn recv(client: &mut Client) -> String {
        client.next().await.unwrap().unwrap()
    }

    /// Sends the startup line and collects replies up to `READY`.
    async fn start(client: &mut Client, startup: &str) -> Vec<String> {
        client.send(startup.to_string()).await.unwrap();
        let mut status = Vec::new();
        loop {
            let line = recv(client).await;
            if line == "READY" {
                return status;
            }
            status.push(line);
        }
    }

    #[tokio::test]
    async fn startup_reports_sorted_server_parameters() {
        let (mut client, _task) = connect(ConnectionConfig::default());
        let status = start(&mut client, "user=alice application_name=psql").await;

        assert_eq!(
            status,
            vec![
                "S application_name=psql",
                "S client_encoding=UTF8",
                "S is_superuser=off",
                "S server_encoding=UTF8",
                "S server_version=15.2",
                "S session_authorization=alice",
            ]
        );
    }

    #[tokio::test]
    async fn show_reads_client_then_server_parameters() {
        let (mut client, _task) = connect(ConnectionConfig::default());
        start(&mut client, "user=alice").await;

        client.send("SHOW server_version".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "V 15.2");
        client.send("show database".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "V alice");
        client.send("SHOW nope".to_string()).await.unwrap();
        assert_eq!(
            recv(&mut client).await,
            "E ERROR 42704 unrecognized configuration parameter \"nope\""
        );
    }

    #[tokio::test]
    async fn set_updates_later_reads() {
        let (mut client, _task) = connect(ConnectionConfig::default());
        start(&mut client, "user=alice application_name=psql").await;

        client
            .send("SET application_name TO 'worker';".to_string())
            .await
            .unwrap();
        assert_eq!(recv(&mut client).await, "S application_name=worker");
        assert_eq!(recv(&mut client).await, "SET");

        client.send("SET search_path = public".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "SET");

        client.send("SHOW application_name".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "V worker");
        client.send("SHOW search_path".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "V public");
    }

    #[tokio::test]
    async fn startup_cannot_override_server_owned_parameters() {
        let (mut client, _task) = connect(ConnectionConfig::default());
        let status = start(&mut client, "user=alice server_version=99 is_superuser=on").await;
        assert!(status.contains(&"S server_version=15.2".to_string()));
        assert!(status.contains(&"S is_superuser=off".to_string()));

        client.send("SHOW server_version".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "V 15.2");
        client.send("SHOW is_superuser".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "V off");
    }

    #[tokio::test]
    async fn set_value_containing_equals_sign() {
        let (mut client, _task) = connect(ConnectionConfig::default());
        start(&mut client, "user=alice").await;

        client
            .send("SET application_name TO 'a=b'".to_string())
            .await
            .unwrap();
        assert_eq!(recv(&mut client).await, "S application_name=a=b");
        assert_eq!(recv(&mut client).await, "SET");
        client.send("SHOW application_name".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "V a=b");
    }

    #[tokio::test]
    async fn set_rejects_read_only_and_malformed() {
        let (mut client, _task) = connect(ConnectionConfig::default());
        start(&mut client, "user=alice").await;

        client.send("SET server_version = 1".to_string()).await.unwrap();
        assert_eq!(
            recv(&mut client).await,
            "E ERROR 55P02 parameter \"server_version\" cannot be changed"
        );

        client.send("SET application_name".to_string()).await.unwrap();
        assert!(recv(&mut client).await.starts_with("E ERROR 42601"));
    }

    #[tokio::test]
    async fn queries_go_through_handler() {
        let (mut client, _task) = connect(ConnectionConfig::default());
        start(&mut client, "user=alice").await;

        client.send("SELECT 1; SELECT 2".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "PREPARED 2");

        client.send(";;".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "E ERROR 42601 empty query");
    }

    #[tokio::test]
    async fn quit_ends_connection_cleanly() {
        let (mut client, task) = connect(ConnectionConfig::default());
        start(&mut client, "user=alice").await;

        client.send("QUIT".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "BYE");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_startup_is_fatal() {
        let (mut client, task) = connect(ConnectionConfig::default());
        client.send("user=alice garbage".to_string()).await.unwrap();
        assert_eq!(
            recv(&mut client).await,
            "E FATAL 08P01 invalid startup parameter \"garbage\""
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_startup_times_out() {
        let (_client, task) = connect(ConnectionConfig {
            handshake_timeout: Duration::from_secs(1),
            ..ConnectionConfig::default()
        });
        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("startup line"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_closed() {
        let (mut client, task) = connect(ConnectionConfig {
            idle_timeout: Duration::from_secs(5),
            ..ConnectionConfig::default()
        });
        start(&mut client, "user=alice").await;

        assert!(recv(&mut client).await.starts_with("E FATAL 57P05"));
        task.await.unwrap().unwrap();
    }

    #[test]
    fn parse_set_forms() {
        assert_eq!(parse_set("a = 1"), Some(("a", "1")));
        assert_eq!(parse_set("a=1;"), Some(("a", "1")));
        assert_eq!(parse_set("a TO 'x y'"), Some(("a", "x y")));
        assert_eq!(parse_set("a"), None);
        assert_eq!(parse_set("a FROM b"), None);
        assert_eq!(parse_set("= 1"), None);
        assert_eq!(parse_set("a TO 'b=c'"), Some(("a", "b=c")));
        assert_eq!(
            parse_set("application_name TO 'a=b'"),
            Some(("application_name", "a=b"))
        );
        assert_eq!(parse_set("a TO"), None);
    }

    #[test]
    fn placeholder_count_uses_highest_index() {
        assert_eq!(placeholder_count("SELECT 1"), 0);
        assert_eq!(placeholder_count("SELECT $10"), 10);
        assert_eq!(placeholder_count("SELECT $2"), 2);
        assert_eq!(placeholder_count("SELECT $1, $1 || '$'"), 1);
    }

    #[tokio::test]
    async fn splitter_counts_placeholders() {
        let ctx = Context::background().with_type_map(Arc::new(TypeMap::postgres_defaults()));
        let stmts = StatementSplitter
            .prepare(&ctx, "UPDATE t SET a = $1 WHERE b = $2")
            .await
            .unwrap();
        assert_eq!(stmts[0].parameters, vec![25, 25]);
        assert!(stmts[0].columns.is_empty());

        let stmts = StatementSplitter
            .prepare(&ctx, "SELECT $10; SELECT $2")
            .await
            .unwrap();
        assert_eq!(stmts[0].parameters.len(), 10);
        assert_eq!(stmts[1].parameters.len(), 2);
    }
}
