//! The toolgate invocation server.
//!
//! [`InvocationServer`] drives one invocation through token verification,
//! tool resolution, permission and schema checks, adapter execution, and audit
//! logging, and always answers with a signed [`toolgate_protocol::Response`].
//! [`GatewayBuilder`] wires it together, either by hand or from a
//! [`GatewayConfig`].

mod builder;
pub mod config;
mod server;

pub use builder::{BuildError, GatewayBuilder, GatewaySigners};
pub use config::{ConfigError, GatewayConfig, HttpConfig};
pub use server::{DEFAULT_TIMEOUT_GRACE, InvocationServer};
