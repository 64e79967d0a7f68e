//! Scope keys for connection metadata held in a [`Context`](crate::Context).

/// Identifies one kind of metadata inside a context chain.
///
/// The set is closed and crate-private. Code outside this crate cannot
/// construct a key, so server-managed metadata is only reachable through the
/// typed accessors on [`Context`](crate::Context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ScopeKey {
    /// Negotiated [`TypeMap`](crate::TypeMap).
    TypeMap,
    /// Parameters announced by the connecting client.
    ClientMetadata,
    /// Parameters the server reports to the client.
    ServerMetadata,
    /// Network endpoint of the peer.
    RemoteAddr,
}

#[cfg(test)]
impl ScopeKey {
    pub(crate) const ALL: [ScopeKey; 4] = [
        ScopeKey::TypeMap,
        ScopeKey::ClientMetadata,
        ScopeKey::ServerMetadata,
        ScopeKey::RemoteAddr,
    ];
}
