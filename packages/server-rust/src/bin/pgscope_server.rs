//! `pgscope-server`: runs the line-protocol demo server.
//!
//! Usage:
//!   pgscope-server                              # 0.0.0.0:5432
//!   pgscope-server --port 6543 --log-json       # custom port, JSON logs
//!   RUST_LOG=pgscope_server=debug pgscope-server
//!
//! Then `nc localhost 5432` and type `user=alice application_name=nc`.

use std::sync::Arc;

use clap::Parser;
use pgscope_core::TypeMap;
use pgscope_server::driver::{LineDriver, StatementSplitter};
use pgscope_server::network::{self, NetworkConfig, NetworkModule};
use pgscope_server::session::{DefaultClassifier, Handshake, SessionConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pgscope-server", about = "Connection-scoped metadata demo server")]
struct Args {
    /// Address to bind to
    #[arg(long, env = "PGSCOPE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (0 for OS-assigned)
    #[arg(long, env = "PGSCOPE_PORT", default_value_t = 5432)]
    port: u16,

    /// Reported to clients as `server_version`
    #[arg(long, env = "PGSCOPE_SERVER_VERSION", default_value = "15.2")]
    server_version: String,

    /// Users reported with `is_superuser = on`
    #[arg(long = "superuser", env = "PGSCOPE_SUPERUSERS", value_delimiter = ',')]
    superusers: Vec<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "PGSCOPE_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = NetworkConfig {
        host: args.host,
        port: args.port,
        ..NetworkConfig::default()
    };
    let session_config = SessionConfig {
        server_version: args.server_version,
        superusers: args.superusers,
        ..SessionConfig::default()
    };

    let mut module = NetworkModule::new(config.clone());
    let registry = module.registry();
    let shutdown = module.shutdown_controller();

    let driver = Arc::new(LineDriver::new(
        Handshake::new(session_config, Arc::new(TypeMap::postgres_defaults())),
        Arc::new(StatementSplitter),
        Arc::new(DefaultClassifier),
        Arc::clone(&shutdown),
        config.connection,
    ));

    let port = module.start().await?;
    info!(port, "pgscope-server started");

    module
        .serve(driver, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for ctrl-c: {e}");
            }
        })
        .await?;

    info!(status = %network::status(&registry, &shutdown), "pgscope-server stopped");
    Ok(())
}
