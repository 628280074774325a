//! Invocation request and response envelope.

use crate::error::GatewayError;
use crate::ids::{CallerId, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Optional per-invocation metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_id: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// A single request to execute one function of one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub request_id: RequestId,
    pub caller_id: CallerId,
    pub capability_token: String,
    pub tool_id: String,
    pub function_name: String,
    pub args: Value,
    #[serde(default)]
    pub metadata: InvocationMetadata,
}

impl Invocation {
    pub fn dry_run(&self) -> bool {
        self.metadata.dry_run
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.metadata.trace_id.as_deref()
    }
}

/// Error taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Validation,
    Execution,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Structured error carried by an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// The envelope returned for every invocation, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    pub status: ResponseStatus,
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub signature: String,
}

/// Borrowed view of the signed part of a response.
#[derive(Serialize)]
struct ResponseSigningView<'a> {
    request_id: &'a RequestId,
    status: ResponseStatus,
    code: i32,
    output: &'a Option<Value>,
    error: &'a Option<ErrorBody>,
}

impl Response {
    pub fn ok(request_id: RequestId, code: i32, output: Value) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Ok,
            code,
            output: Some(output),
            error: None,
            signature: String::new(),
        }
    }

    pub fn from_error(request_id: RequestId, error: &GatewayError) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Error,
            code: error.code(),
            output: None,
            error: Some(ErrorBody {
                kind: error.kind(),
                message: error.to_string(),
                details: error.details(),
            }),
            signature: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|error| error.kind)
    }

    /// Canonical bytes covered by [`Response::signature`].
    pub fn signing_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&ResponseSigningView {
            request_id: &self.request_id,
            status: self.status,
            code: self.code,
            output: &self.output,
            error: &self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_is_optional_on_the_wire() {
        let invocation: Invocation = serde_json::from_value(json!({
            "request_id": "req-1",
            "caller_id": "agent",
            "capability_token": "t",
            "tool_id": "script-runner",
            "function_name": "run_script",
            "args": {"script_name": "forge:benchmark"}
        }))
        .unwrap();
        assert!(!invocation.dry_run());
        assert!(invocation.trace_id().is_none());
    }

    #[test]
    fn error_response_serializes_type_field() {
        let response = Response::from_error(
            RequestId::from("req-2"),
            &GatewayError::UnknownTool("nope".into()),
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], 400);
        assert_eq!(value["error"]["type"], "validation");
        assert!(value.get("output").is_none());
    }

    #[test]
    fn signing_payload_ignores_signature() {
        let mut response = Response::ok(RequestId::from("req-3"), 0, json!({"x": 1}));
        let before = response.signing_payload().unwrap();
        response.signature = "k1:abcd".into();
        assert_eq!(before, response.signing_payload().unwrap());
    }
}
