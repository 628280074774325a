//! Signed, append-only audit trail.
//!
//! Every invocation the gateway accepts ends in exactly one [`AuditEvent`]
//! written through [`AuditLogger::record`] before the caller sees a response.

mod logger;
mod redact;
mod store;

use thiserror::Error;

pub use logger::{AuditEntry, AuditHub, AuditLogger, AuditVerification};
pub use redact::{REDACTED, redact_args};
pub use store::{AuditStore, FileAuditStore, InMemoryAuditStore};
pub use toolgate_protocol::AuditEvent;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode audit event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt audit record at line {line}: {source}")]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}
