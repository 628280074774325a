//! Persisted audit record.

use crate::ids::{CallerId, EventId, RequestId};
use crate::invocation::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One signed record per invocation attempt. Never mutated after signing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: EventId,
    pub request_id: RequestId,
    pub caller_id: CallerId,
    pub tool_id: String,
    pub function_name: String,
    /// Arguments after redaction.
    pub args: Value,
    pub result_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub key_id: String,
    pub signature: String,
}

#[derive(Serialize)]
struct AuditSigningView<'a> {
    event_id: &'a EventId,
    request_id: &'a RequestId,
    caller_id: &'a CallerId,
    tool_id: &'a str,
    function_name: &'a str,
    args: &'a Value,
    result_code: i32,
    error_kind: Option<ErrorKind>,
    dry_run: bool,
    trace_id: Option<&'a str>,
    timestamp: &'a DateTime<Utc>,
    key_id: &'a str,
}

impl AuditEvent {
    /// Canonical bytes bound by [`AuditEvent::signature`]: every field except the signature.
    pub fn signing_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&AuditSigningView {
            event_id: &self.event_id,
            request_id: &self.request_id,
            caller_id: &self.caller_id,
            tool_id: &self.tool_id,
            function_name: &self.function_name,
            args: &self.args,
            result_code: self.result_code,
            error_kind: self.error_kind,
            dry_run: self.dry_run,
            trace_id: self.trace_id.as_deref(),
            timestamp: &self.timestamp,
            key_id: &self.key_id,
        })
    }
}
