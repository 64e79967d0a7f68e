//! Typed accessors for connection metadata stored in a [`Context`].
//!
//! Each metadata kind has exactly one setter/getter pair bound to its own
//! private [`ScopeKey`]. Setters always derive a new context; getters return
//! `None` when nothing was attached on this context or any ancestor.

use std::sync::Arc;

use tracing::trace;

use crate::addr::RemoteAddr;
use crate::context::Context;
use crate::keys::ScopeKey;
use crate::parameters::{ParameterKind, Parameters};
use crate::types::TypeMap;

impl ParameterKind {
    fn scope_key(self) -> ScopeKey {
        match self {
            Self::Client => ScopeKey::ClientMetadata,
            Self::Server => ScopeKey::ServerMetadata,
        }
    }
}

impl Context {
    /// Derives a context carrying the negotiated type map.
    #[must_use]
    pub fn with_type_map(&self, types: Arc<TypeMap>) -> Context {
        self.with_value(ScopeKey::TypeMap, types)
    }

    /// Returns the negotiated type map if the handshake attached one.
    #[must_use]
    pub fn type_map(&self) -> Option<Arc<TypeMap>> {
        self.value(ScopeKey::TypeMap)
            .cloned()
            .and_then(|v| v.downcast::<TypeMap>().ok())
    }

    /// Derives a context carrying the peer address.
    #[must_use]
    pub fn with_remote_addr(&self, addr: RemoteAddr) -> Context {
        self.with_value(ScopeKey::RemoteAddr, Arc::new(addr))
    }

    /// Returns the peer address attached at connection acceptance.
    #[must_use]
    pub fn remote_addr(&self) -> Option<&RemoteAddr> {
        self.value_ref::<RemoteAddr>(ScopeKey::RemoteAddr)
    }

    /// Derives a context carrying `params` as the `kind` parameter set.
    ///
    /// `None` returns `self` unchanged, so an earlier set of the same kind
    /// stays visible. Any `Some` set, including an empty one, replaces (does
    /// not merge with) whatever was attached before; use
    /// [`Parameters::merged`] first for an incremental update.
    #[must_use]
    pub fn with_parameters(
        &self,
        kind: ParameterKind,
        params: impl Into<Option<Parameters>>,
    ) -> Context {
        match params.into() {
            Some(params) => self.with_value(kind.scope_key(), Arc::new(params)),
            None => {
                trace!(?kind, "no parameter set, context unchanged");
                self.clone()
            }
        }
    }

    /// Returns the nearest `kind` parameter set, or `None` if none was ever
    /// attached.
    #[must_use]
    pub fn parameters(&self, kind: ParameterKind) -> Option<&Parameters> {
        self.value_ref::<Parameters>(kind.scope_key())
    }

    /// Shorthand for [`with_parameters`](Self::with_parameters) with [`ParameterKind::Client`].
    #[must_use]
    pub fn with_client_parameters(&self, params: impl Into<Option<Parameters>>) -> Context {
        self.with_parameters(ParameterKind::Client, params)
    }

    /// Parameters the client announced, as of this context.
    #[must_use]
    pub fn client_parameters(&self) -> Option<&Parameters> {
        self.parameters(ParameterKind::Client)
    }

    /// Shorthand for [`with_parameters`](Self::with_parameters) with [`ParameterKind::Server`].
    #[must_use]
    pub fn with_server_parameters(&self, params: impl Into<Option<Parameters>>) -> Context {
        self.with_parameters(ParameterKind::Server, params)
    }

    /// Parameters the server reports to the client, as of this context.
    #[must_use]
    pub fn server_parameters(&self) -> Option<&Parameters> {
        self.parameters(ParameterKind::Server)
    }
}
