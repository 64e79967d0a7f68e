//! `pgscope` server: TCP acceptance, startup handshake, sessions, and error
//! classification on top of the scoped connection metadata in `pgscope-core`.

pub mod driver;
pub mod network;
pub mod session;
pub mod traits;

pub use traits::{ConnectionDriver, ErrorClassifier, QueryHandler};
