//! pgscope core: connection-scoped context, parameter status model, and
//! negotiated type map for a Postgres wire-protocol server.

pub mod addr;
pub mod context;
mod keys;
pub mod metadata;
pub mod parameters;
pub mod types;

pub use addr::RemoteAddr;
pub use context::{CancelHandle, Context, ContextError};
pub use parameters::{ParameterKind, ParameterStatus, Parameters};
pub use types::{Format, Oid, TypeInfo, TypeMap};
