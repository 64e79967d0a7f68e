//! Startup handshake: turns the client's startup parameters into the
//! session's initial context.

use std::sync::Arc;

use pgscope_core::{Context, ParameterStatus, Parameters, TypeMap};
use tracing::{debug, info};

use super::config::SessionConfig;
use super::state::is_server_owned;

/// Completes the startup phase of a connection.
///
/// Shared by every connection; holds only server-wide settings.
#[derive(Debug, Clone)]
pub struct Handshake {
    config: Arc<SessionConfig>,
    types: Arc<TypeMap>,
}

impl Handshake {
    #[must_use]
    pub fn new(config: SessionConfig, types: Arc<TypeMap>) -> Self {
        Self {
            config: Arc::new(config),
            types,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Client parameters as negotiated: the startup set minus server-owned
    /// tags, with `client_encoding` defaulted and `database` falling back to
    /// `user`.
    #[must_use]
    pub fn client_parameters(&self, startup: Parameters) -> Parameters {
        let mut client: Parameters = startup
            .into_iter()
            .filter(|(status, _)| {
                let owned = is_server_owned(status.as_str());
                if owned {
                    debug!(parameter = %status, "ignoring server-owned startup parameter");
                }
                !owned
            })
            .collect();
        if !client.contains(ParameterStatus::CLIENT_ENCODING.as_str()) {
            client.insert(
                ParameterStatus::CLIENT_ENCODING,
                self.config.default_client_encoding.clone(),
            );
        }
        if !client.contains(ParameterStatus::DATABASE.as_str()) {
            if let Some(user) = client.get(ParameterStatus::USER.as_str()).map(str::to_owned) {
                client.insert(ParameterStatus::DATABASE, user);
            }
        }
        client
    }

    /// Server parameters reported back to a client with the given
    /// (already negotiated) client set.
    #[must_use]
    pub fn server_parameters(&self, client: &Parameters) -> Parameters {
        let mut server = Parameters::new()
            .with(ParameterStatus::SERVER_VERSION, self.config.server_version.clone())
            .with(ParameterStatus::SERVER_ENCODING, self.config.server_encoding.clone());

        let encoding = client
            .get(ParameterStatus::CLIENT_ENCODING.as_str())
            .unwrap_or(self.config.default_client_encoding.as_str());
        server.insert(ParameterStatus::CLIENT_ENCODING, encoding);

        let user = client.get(ParameterStatus::USER.as_str());
        let superuser = user.is_some_and(|u| self.config.is_superuser(u));
        server.insert(
            ParameterStatus::IS_SUPERUSER,
            if superuser { "on" } else { "off" },
        );
        if let Some(user) = user {
            server.insert(ParameterStatus::SESSION_AUTHORIZATION, user);
        }
        if let Some(app) = client.get(ParameterStatus::APPLICATION_NAME.as_str()) {
            server.insert(ParameterStatus::APPLICATION_NAME, app);
        }
        server
    }

    /// Attaches the type map and both parameter sets to `ctx`.
    ///
    /// `ctx` is normally the connection's base context, which already
    /// carries the remote address.
    #[must_use]
    pub fn complete(&self, ctx: &Context, startup: Parameters) -> Context {
        let client = self.client_parameters(startup);
        let server = self.server_parameters(&client);

        info!(
            remote = ?ctx.remote_addr().map(ToString::to_string),
            user = client.get(ParameterStatus::USER.as_str()).unwrap_or("<none>"),
            database = client.get(ParameterStatus::DATABASE.as_str()).unwrap_or("<none>"),
            "startup handshake complete"
        );

        ctx.with_type_map(Arc::clone(&self.types))
            .with_client_parameters(client)
            .with_server_parameters(server)
    }
}
