//! Runtime boundary ports.
//!
//! These traits are the only seams between the invocation server and the
//! pieces a deployment swaps out: the adapters that reach external systems and
//! the signing mechanism shared by tokens, responses, and audit records.
//! Traits use `async-trait` for async dyn-dispatch.

use std::time::Duration;

use crate::error::AdapterError;
use crate::ids::RequestId;
use crate::tool::AdapterResult;
use async_trait::async_trait;
use serde_json::Value;

/// Per-invocation context handed to an adapter.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub request_id: RequestId,
    pub trace_id: Option<String>,
    /// When set the adapter must not perform any side effect.
    pub dry_run: bool,
    /// Declared timeout of the function being executed.
    pub timeout: Duration,
}

impl AdapterContext {
    pub fn new(request_id: RequestId, timeout: Duration) -> Self {
        Self {
            request_id,
            trace_id: None,
            dry_run: false,
            timeout,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }
}

/// Executes the functions of one tool against an external system.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn run(
        &self,
        function: &str,
        args: &Value,
        ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError>;
}

/// Integrity signing used for tokens, responses, and audit records.
pub trait Signer: Send + Sync {
    /// Identifier of the key new signatures are made with.
    fn key_id(&self) -> &str;
    fn sign(&self, payload: &[u8]) -> String;
    fn verify(&self, payload: &[u8], signature: &str) -> bool;
}
