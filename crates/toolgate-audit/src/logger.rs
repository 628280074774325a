use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use toolgate_protocol::{
    AuditEvent, CallerId, ErrorKind, EventId, RequestId, Sensitivity, Signer,
};
use tracing::{debug, instrument, warn};

use crate::redact::redact_args;
use crate::store::AuditStore;
use crate::AuditError;

/// Live fan-out of persisted audit events.
#[derive(Clone, Debug)]
pub struct AuditHub {
    sender: broadcast::Sender<AuditEvent>,
}

impl AuditHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, event: AuditEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<AuditEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl Default for AuditHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Everything the logger needs to know about one finished invocation.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub request_id: RequestId,
    pub caller_id: CallerId,
    pub tool_id: String,
    pub function_name: String,
    /// Raw arguments; redacted according to `sensitivity` before persisting.
    pub args: Value,
    pub sensitivity: Sensitivity,
    pub result_code: i32,
    pub error_kind: Option<ErrorKind>,
    pub dry_run: bool,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditVerification {
    pub total: usize,
    /// Records whose signature no longer matches their content.
    pub tampered: Vec<EventId>,
}

impl AuditVerification {
    pub fn is_clean(&self) -> bool {
        self.tampered.is_empty()
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
    signer: Arc<dyn Signer>,
    hub: AuditHub,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>, signer: Arc<dyn Signer>, hub: AuditHub) -> Self {
        Self { store, signer, hub }
    }

    pub fn hub(&self) -> &AuditHub {
        &self.hub
    }

    /// Redact, sign, persist, then publish. The event is durable when this returns `Ok`.
    #[instrument(
        skip(self, entry),
        fields(
            request_id = %entry.request_id,
            tool_id = %entry.tool_id,
            result_code = entry.result_code
        )
    )]
    pub async fn record(&self, entry: AuditEntry) -> Result<AuditEvent, AuditError> {
        let mut event = AuditEvent {
            event_id: EventId::new_uuid(),
            request_id: entry.request_id,
            caller_id: entry.caller_id,
            tool_id: entry.tool_id,
            function_name: entry.function_name,
            args: redact_args(&entry.args, entry.sensitivity),
            result_code: entry.result_code,
            error_kind: entry.error_kind,
            dry_run: entry.dry_run,
            trace_id: entry.trace_id,
            timestamp: Utc::now(),
            key_id: self.signer.key_id().to_owned(),
            signature: String::new(),
        };
        event.signature = self.signer.sign(&event.signing_payload()?);

        self.store.append(&event).await?;
        self.hub.publish(event.clone());
        debug!(event_id = %event.event_id, "audit event recorded");
        Ok(event)
    }

    pub async fn find(&self, request_id: &RequestId) -> Result<Option<AuditEvent>, AuditError> {
        self.store.find_by_request(request_id).await
    }

    pub async fn read_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        self.store.read_all().await
    }

    /// True when the record's signature matches its content under a known key.
    pub fn verify(&self, event: &AuditEvent) -> bool {
        if !event.signature.starts_with(&format!("{}:", event.key_id)) {
            return false;
        }
        event
            .signing_payload()
            .map(|payload| self.signer.verify(&payload, &event.signature))
            .unwrap_or(false)
    }

    /// Re-check every persisted record.
    #[instrument(skip(self))]
    pub async fn verify_all(&self) -> Result<AuditVerification, AuditError> {
        let events = self.store.read_all().await?;
        let tampered: Vec<EventId> = events
            .iter()
            .filter(|event| !self.verify(event))
            .map(|event| event.event_id.clone())
            .collect();
        if !tampered.is_empty() {
            warn!(tampered = tampered.len(), "audit records failed verification");
        }
        Ok(AuditVerification {
            total: events.len(),
            tampered,
        })
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<AuditEvent> {
        self.hub.subscribe_stream()
    }
}
