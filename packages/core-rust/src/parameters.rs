//! Parameter status tags and parameter sets exchanged between client and
//! server.
//!
//! A fixed set of tags is reported by every Postgres server through
//! `ParameterStatus` messages (see "Asynchronous Operations" in the protocol
//! flow docs). Any other tag is legal and passed through untouched.

use std::borrow::{Borrow, Cow};
use std::collections::hash_map;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A string-valued tag naming one piece of session metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterStatus(Cow<'static, str>);

impl ParameterStatus {
    pub const SERVER_ENCODING: Self = Self(Cow::Borrowed("server_encoding"));
    pub const CLIENT_ENCODING: Self = Self(Cow::Borrowed("client_encoding"));
    pub const IS_SUPERUSER: Self = Self(Cow::Borrowed("is_superuser"));
    pub const SESSION_AUTHORIZATION: Self = Self(Cow::Borrowed("session_authorization"));
    pub const APPLICATION_NAME: Self = Self(Cow::Borrowed("application_name"));
    pub const DATABASE: Self = Self(Cow::Borrowed("database"));
    pub const USER: Self = Self(Cow::Borrowed("user"));
    pub const SERVER_VERSION: Self = Self(Cow::Borrowed("server_version"));

    /// Tags for which the server generates `ParameterStatus` messages.
    pub const RECOGNIZED: [Self; 8] = [
        Self::SERVER_ENCODING,
        Self::CLIENT_ENCODING,
        Self::IS_SUPERUSER,
        Self::SESSION_AUTHORIZATION,
        Self::APPLICATION_NAME,
        Self::DATABASE,
        Self::USER,
        Self::SERVER_VERSION,
    ];

    /// Creates a tag from any name. Unknown names are accepted as-is.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the protocol's hard-wired tags.
    #[must_use]
    pub fn is_recognized(&self) -> bool {
        Self::RECOGNIZED.iter().any(|tag| tag == self)
    }
}

impl fmt::Display for ParameterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ParameterStatus {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for ParameterStatus {
    fn from(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

impl From<String> for ParameterStatus {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

/// Lookup table from [`ParameterStatus`] to its value.
///
/// Once attached to a [`Context`](crate::Context) a set is never changed in
/// place; updates build a new set and attach it again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(HashMap<ParameterStatus, String>);

impl Parameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, status: impl Into<ParameterStatus>, value: impl Into<String>) -> Self {
        self.insert(status, value);
        self
    }

    /// Inserts a value, returning the previous one for the same tag.
    pub fn insert(
        &mut self,
        status: impl Into<ParameterStatus>,
        value: impl Into<String>,
    ) -> Option<String> {
        self.0.insert(status.into(), value.into())
    }

    pub fn remove(&mut self, status: &str) -> Option<String> {
        self.0.remove(status)
    }

    #[must_use]
    pub fn get(&self, status: &str) -> Option<&str> {
        self.0.get(status).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, status: &str) -> bool {
        self.0.contains_key(status)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, ParameterStatus, String> {
        self.0.iter()
    }

    /// Returns the union of `self` and `other`; values in `other` win.
    ///
    /// Attaching a set to a context replaces the earlier one of the same
    /// kind, so callers wanting an incremental update read the current set
    /// and attach `current.merged(&update)`.
    #[must_use]
    pub fn merged(&self, other: &Parameters) -> Parameters {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }
}

impl<K, V> FromIterator<(K, V)> for Parameters
where
    K: Into<ParameterStatus>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl IntoIterator for Parameters {
    type Item = (ParameterStatus, String);
    type IntoIter = hash_map::IntoIter<ParameterStatus, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Parameters {
    type Item = (&'a ParameterStatus, &'a String);
    type IntoIter = hash_map::Iter<'a, ParameterStatus, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Which side of the connection a [`Parameters`] set describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    /// Learned from the connecting client (startup packet, `SET`).
    Client,
    /// Exposed by the server to the client.
    Server,
}
