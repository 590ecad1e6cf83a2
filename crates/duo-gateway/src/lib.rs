//! Connection registry and message relay for one-to-one chat.

pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod session;
pub mod store;

pub use config::GatewayConfig;
pub use connection::{ConnectionContext, handle_connection};
pub use registry::{Registry, SessionHandle};
