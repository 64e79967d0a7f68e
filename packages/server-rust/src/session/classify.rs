//! Error classification: maps handler errors to SQLSTATE codes and severities.

use std::borrow::Cow;
use std::fmt;

use pgscope_core::{Context, ContextError, ParameterStatus};
use serde::Serialize;

use super::state::SessionError;
use crate::traits::ErrorClassifier;

/// Severity field of an `ErrorResponse` / `NoticeResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Fatal,
    Panic,
    Warning,
    Notice,
    Debug,
    Info,
    Log,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Panic => "PANIC",
            Self::Warning => "WARNING",
            Self::Notice => "NOTICE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Log => "LOG",
        }
    }

    /// `FATAL` and `PANIC` end the session.
    #[must_use]
    pub fn terminates_session(self) -> bool {
        matches!(self, Self::Fatal | Self::Panic)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Five-character SQLSTATE code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SqlState(Cow<'static, str>);

impl SqlState {
    pub const SUCCESSFUL_COMPLETION: Self = Self(Cow::Borrowed("00000"));
    pub const FEATURE_NOT_SUPPORTED: Self = Self(Cow::Borrowed("0A000"));
    pub const PROTOCOL_VIOLATION: Self = Self(Cow::Borrowed("08P01"));
    pub const INVALID_PARAMETER_VALUE: Self = Self(Cow::Borrowed("22023"));
    pub const SYNTAX_ERROR: Self = Self(Cow::Borrowed("42601"));
    pub const UNDEFINED_OBJECT: Self = Self(Cow::Borrowed("42704"));
    pub const UNDEFINED_TABLE: Self = Self(Cow::Borrowed("42P01"));
    pub const CANT_CHANGE_RUNTIME_PARAM: Self = Self(Cow::Borrowed("55P02"));
    pub const QUERY_CANCELED: Self = Self(Cow::Borrowed("57014"));
    pub const ADMIN_SHUTDOWN: Self = Self(Cow::Borrowed("57P01"));
    pub const INTERNAL_ERROR: Self = Self(Cow::Borrowed("XX000"));

    /// Wraps a code not covered by the constants above.
    pub fn new(code: impl Into<Cow<'static, str>>) -> Self {
        Self(code.into())
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error a [`QueryHandler`](crate::QueryHandler) returns when it already
/// knows the SQLSTATE to report.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct QueryError {
    pub code: SqlState,
    pub severity: Severity,
    pub message: String,
    pub hint: Option<String>,
}

impl QueryError {
    pub fn new(code: SqlState, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Error,
            message: message.into(),
            hint: None,
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(SqlState::SYNTAX_ERROR, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(SqlState::FEATURE_NOT_SUPPORTED, message)
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Classified error, ready to be serialized to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{severity}: {message} (SQLSTATE {code})")]
pub struct ErrorResponse {
    pub severity: Severity,
    pub code: SqlState,
    pub message: String,
    pub hint: Option<String>,
    /// Peer the failing query came from.
    pub remote_addr: Option<String>,
    /// `application_name` the client had set when the query ran.
    pub application_name: Option<String>,
}

/// Classifier used when the embedding server supplies none.
///
/// Recognizes [`QueryError`], [`SessionError`], and [`ContextError`] anywhere
/// in the error chain; everything else is an internal error.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl DefaultClassifier {
    fn code_and_severity(err: &anyhow::Error) -> (SqlState, Severity, String, Option<String>) {
        for cause in err.chain() {
            if let Some(query) = cause.downcast_ref::<QueryError>() {
                return (
                    query.code.clone(),
                    query.severity,
                    query.message.clone(),
                    query.hint.clone(),
                );
            }
            if let Some(session) = cause.downcast_ref::<SessionError>() {
                return match session {
                    SessionError::ReadOnlyParameter(_) => (
                        SqlState::CANT_CHANGE_RUNTIME_PARAM,
                        Severity::Error,
                        session.to_string(),
                        None,
                    ),
                    SessionError::Closed(_) => (
                        SqlState::ADMIN_SHUTDOWN,
                        Severity::Fatal,
                        "terminating connection".to_string(),
                        None,
                    ),
                };
            }
            if let Some(ctx_err) = cause.downcast_ref::<ContextError>() {
                let message = match ctx_err {
                    ContextError::Cancelled => "canceling statement due to user request",
                    ContextError::DeadlineExceeded => "canceling statement due to statement timeout",
                };
                return (SqlState::QUERY_CANCELED, Severity::Error, message.to_string(), None);
            }
        }
        (SqlState::INTERNAL_ERROR, Severity::Error, format!("{err:#}"), None)
    }
}

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, ctx: &Context, err: &anyhow::Error) -> ErrorResponse {
        let (code, severity, message, hint) = Self::code_and_severity(err);
        ErrorResponse {
            severity,
            code,
            message,
            hint,
            remote_addr: ctx.remote_addr().map(ToString::to_string),
            application_name: ctx
                .client_parameters()
                .and_then(|p| p.get(ParameterStatus::APPLICATION_NAME.as_str()))
                .map(str::to_owned),
        }
    }
}
