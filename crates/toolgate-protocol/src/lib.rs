//! # toolgate-protocol: gateway contract types
//!
//! Shared types and trait interfaces for the toolgate invocation gateway. The
//! crate carries no runtime dependencies (no tokio, axum, or reqwest) so every
//! other workspace member, and external callers, can depend on it as a pure
//! contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (RequestId, CallerId, EventId, ChangeId)
//! - [`permission`]: Permission strings and wildcard matching
//! - [`tool`]: ToolDefinition, FunctionDefinition, AdapterResult
//! - [`invocation`]: Invocation request, Response envelope, ErrorKind
//! - [`audit`]: AuditEvent and its signing payload
//! - [`ports`]: ToolAdapter and Signer boundaries
//! - [`error`]: GatewayError, AdapterError

pub mod audit;
pub mod error;
pub mod ids;
pub mod invocation;
pub mod permission;
pub mod ports;
pub mod tool;

pub use audit::AuditEvent;
pub use error::{AdapterError, GatewayError};
pub use ids::{CallerId, ChangeId, EventId, RequestId};
pub use invocation::{
    ErrorBody, ErrorKind, Invocation, InvocationMetadata, Response, ResponseStatus,
};
pub use permission::Permission;
pub use ports::{AdapterContext, Signer, ToolAdapter};
pub use tool::{AdapterResult, FunctionDefinition, Sensitivity, ToolDefinition};
