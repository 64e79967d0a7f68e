//! Prepared statement descriptions returned by a [`QueryHandler`](crate::QueryHandler).

use pgscope_core::{Format, Oid, TypeMap};
use serde::Serialize;

/// One result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
    pub format: Format,
}

impl Column {
    /// Builds a column using the connection's preferred format for `type_oid`.
    pub fn new(name: impl Into<String>, type_oid: Oid, types: &TypeMap) -> Self {
        Self {
            name: name.into(),
            type_oid,
            format: types.format_for(type_oid),
        }
    }
}

/// A parsed statement ready for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedStatement {
    pub query: String,
    /// Parameter type OIDs, in `$n` order.
    pub parameters: Vec<Oid>,
    pub columns: Vec<Column>,
}

impl PreparedStatement {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            parameters: Vec::new(),
            columns: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Vec<Oid>) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn with_columns(mut self, columns: Vec<Column>) -> Self {
        self.columns = columns;
        self
    }
}

/// All statements produced from one query string.
pub type PreparedStatements = Vec<PreparedStatement>;
