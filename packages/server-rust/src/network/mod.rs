//! Networking: configuration, connection tracking, shutdown control, and the
//! TCP accept loop.

pub mod config;
pub mod connection;
pub mod module;
pub mod shutdown;
pub mod status;

pub use config::*;
pub use connection::*;
pub use module::NetworkModule;
pub use shutdown::*;
pub use status::status;
