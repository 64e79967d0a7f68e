//! Session layer: startup handshake, runtime parameter updates, query
//! dispatch, and error classification.
//!
//! Everything here reads connection metadata from a [`Context`](pgscope_core::Context)
//! rather than from shared per-connection state.

pub mod classify;
pub mod config;
pub mod handshake;
pub mod state;
pub mod statement;

pub use classify::{DefaultClassifier, ErrorResponse, QueryError, Severity, SqlState};
pub use config::SessionConfig;
pub use handshake::Handshake;
pub use state::{is_server_owned, ParameterChange, Session, SessionError};
pub use statement::{Column, PreparedStatement, PreparedStatements};
