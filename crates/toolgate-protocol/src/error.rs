//! Error types for the gateway.

use crate::invocation::ErrorKind;
use serde_json::{Value, json};
use thiserror::Error;

/// Failures raised by tool adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Operand outside the adapter's allow-list.
    #[error("{0}")]
    NotAllowed(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

impl AdapterError {
    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self::NotAllowed(message.into())
    }

    /// Stable label recorded in `error.details.adapter_error`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotAllowed(_) => "not_allowed",
            Self::UnknownFunction(_) => "unknown_function",
            Self::InvalidArgs(_) => "invalid_args",
            Self::Timeout { .. } => "timeout",
            Self::Io(_) => "io",
            Self::Backend(_) => "backend",
        }
    }
}

/// Terminal failures of one invocation, mapped onto the response taxonomy.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed invocation: {0}")]
    Malformed(String),
    #[error("capability token rejected: {0}")]
    InvalidToken(String),
    #[error("caller lacks required permissions: {}", .missing.join(", "))]
    Forbidden { missing: Vec<String> },
    #[error("duplicate request id: {0}")]
    DuplicateRequest(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("unknown function {function} on tool {tool}")]
    UnknownFunction { tool: String, function: String },
    #[error("arguments failed input schema")]
    SchemaViolation { violations: Vec<String> },
    #[error("adapter failed: {0}")]
    Adapter(#[from] AdapterError),
    #[error("execution failed with result code {code}")]
    Failed { code: i32, output: Value },
    #[error("function timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },
    #[error("adapter output failed output schema")]
    OutputSchema { violations: Vec<String> },
    #[error("audit write failed: {0}")]
    Audit(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidToken(_) | Self::Forbidden { .. } => ErrorKind::Auth,
            Self::Malformed(_)
            | Self::DuplicateRequest(_)
            | Self::UnknownTool(_)
            | Self::UnknownFunction { .. }
            | Self::SchemaViolation { .. } => ErrorKind::Validation,
            Self::Adapter(_) | Self::Failed { .. } | Self::Timeout { .. } => ErrorKind::Execution,
            Self::OutputSchema { .. } | Self::Audit(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP-equivalent code written to the response and the audit record.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidToken(_) | Self::Forbidden { .. } => 403,
            Self::DuplicateRequest(_) => 409,
            Self::Malformed(_)
            | Self::UnknownTool(_)
            | Self::UnknownFunction { .. }
            | Self::SchemaViolation { .. } => 400,
            _ => 500,
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Forbidden { missing } => Some(json!({ "missing_permissions": missing })),
            Self::SchemaViolation { violations } | Self::OutputSchema { violations } => {
                Some(json!({ "violations": violations }))
            }
            Self::Adapter(error) => Some(json!({ "adapter_error": error.kind() })),
            Self::Failed { code, output } => Some(json!({
                "adapter_error": "nonzero_result",
                "result_code": code,
                "output": output,
            })),
            Self::Timeout { after_ms } => Some(json!({
                "adapter_error": "timeout",
                "timeout_ms": after_ms,
            })),
            _ => None,
        }
    }
}
