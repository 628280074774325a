use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use toolgate_audit::{AuditEntry, AuditLogger};
use toolgate_policy::{CapabilityVerifier, evaluate_permissions};
use toolgate_protocol::{
    AdapterContext, CallerId, ErrorKind, GatewayError, Invocation, RequestId, Response,
    Sensitivity, Signer,
};
use toolgate_tools::ToolRegistry;
use tracing::{Instrument, debug, info_span, warn};

/// Extra time granted beyond a function's declared timeout before the server
/// abandons the adapter call. Adapters enforce the declared timeout themselves.
pub const DEFAULT_TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// The invocation state machine.
///
/// `received → token_verified → tool_resolved → schema_validated → executed →
/// logged → responded`; any failure skips straight to `logged`.
#[derive(Clone)]
pub struct InvocationServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    registry: Arc<ToolRegistry>,
    verifier: CapabilityVerifier,
    signer: Arc<dyn Signer>,
    audit: AuditLogger,
    in_flight: Mutex<HashSet<RequestId>>,
    timeout_grace: Duration,
}

/// Removes a request id from the in-flight set when the invocation ends.
struct InFlightClaim<'a> {
    in_flight: &'a Mutex<HashSet<RequestId>>,
    request_id: RequestId,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.request_id);
    }
}

/// What the pipeline learned before it stopped, for the audit record.
struct Outcome {
    sensitivity: Sensitivity,
    result: Result<Value, GatewayError>,
}

impl InvocationServer {
    pub(crate) fn new(
        registry: Arc<ToolRegistry>,
        verifier: CapabilityVerifier,
        signer: Arc<dyn Signer>,
        audit: AuditLogger,
        timeout_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                registry,
                verifier,
                signer,
                audit,
                in_flight: Mutex::new(HashSet::new()),
                timeout_grace,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    pub fn verifier(&self) -> &CapabilityVerifier {
        &self.inner.verifier
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.inner.audit
    }

    /// Check a response signature produced by this gateway.
    pub fn verify_response(&self, response: &Response) -> bool {
        response
            .signing_payload()
            .map(|payload| self.inner.signer.verify(&payload, &response.signature))
            .unwrap_or(false)
    }

    /// Entry point for raw request bodies. Bodies that do not parse into an
    /// invocation are answered but not audited.
    pub async fn invoke_value(&self, body: Value) -> Response {
        match serde_json::from_value::<Invocation>(body.clone()) {
            Ok(invocation) => self.invoke(invocation).await,
            Err(err) => {
                let request_id = body
                    .get("request_id")
                    .and_then(Value::as_str)
                    .map(RequestId::from)
                    .unwrap_or_else(|| RequestId::from(""));
                self.reject_malformed(request_id, err.to_string())
            }
        }
    }

    /// Like [`InvocationServer::invoke_value`], for bodies that may not be JSON at all.
    pub async fn invoke_bytes(&self, body: &[u8]) -> Response {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => self.invoke_value(value).await,
            Err(err) => self.reject_malformed(RequestId::from(""), err.to_string()),
        }
    }

    fn reject_malformed(&self, request_id: RequestId, reason: String) -> Response {
        warn!(request_id = %request_id, error = %reason, "malformed invocation body");
        self.seal(Response::from_error(
            request_id,
            &GatewayError::Malformed(reason),
        ))
    }

    pub async fn invoke(&self, invocation: Invocation) -> Response {
        let span = info_span!(
            "tool.invoke",
            request_id = %invocation.request_id,
            caller_id = %invocation.caller_id,
            tool_id = %invocation.tool_id,
            function = %invocation.function_name,
            dry_run = invocation.dry_run()
        );
        self.invoke_inner(invocation).instrument(span).await
    }

    async fn invoke_inner(&self, invocation: Invocation) -> Response {
        let request_id = invocation.request_id.clone();
        if request_id.is_blank() {
            warn!("invocation without request_id");
            return self.seal(Response::from_error(
                request_id,
                &GatewayError::Malformed("request_id must not be empty".to_owned()),
            ));
        }

        let _claim = match self.claim(&request_id).await {
            Ok(claim) => claim,
            Err(error) => {
                warn!(%error, "invocation rejected before processing");
                return self.seal(Response::from_error(request_id, &error));
            }
        };

        let outcome = self.process(&invocation).await;
        let mut response = match &outcome.result {
            Ok(output) => Response::ok(request_id.clone(), 0, output.clone()),
            Err(error) => Response::from_error(request_id.clone(), error),
        };

        let entry = AuditEntry {
            request_id: request_id.clone(),
            caller_id: invocation.caller_id.clone(),
            tool_id: invocation.tool_id.clone(),
            function_name: invocation.function_name.clone(),
            args: invocation.args.clone(),
            sensitivity: outcome.sensitivity,
            result_code: response.code,
            error_kind: response.error_kind(),
            dry_run: invocation.dry_run(),
            trace_id: invocation.metadata.trace_id.clone(),
        };
        if let Err(error) = self.inner.audit.record(entry).await {
            warn!(%error, "audit write failed");
            response = Response::from_error(request_id, &GatewayError::Audit(error.to_string()));
        }

        debug!(code = response.code, "invocation responded");
        self.seal(response)
    }

    /// Reserve a request id for the lifetime of one invocation. Ids already in
    /// flight or already present in the audit trail are replays.
    async fn claim(&self, request_id: &RequestId) -> Result<InFlightClaim<'_>, GatewayError> {
        if !self.inner.in_flight.lock().insert(request_id.clone()) {
            return Err(GatewayError::DuplicateRequest(request_id.to_string()));
        }
        let claim = InFlightClaim {
            in_flight: &self.inner.in_flight,
            request_id: request_id.clone(),
        };
        match self.inner.audit.find(request_id).await {
            Ok(None) => Ok(claim),
            Ok(Some(_)) => Err(GatewayError::DuplicateRequest(request_id.to_string())),
            Err(error) => Err(GatewayError::Audit(error.to_string())),
        }
    }

    async fn process(&self, invocation: &Invocation) -> Outcome {
        let mut sensitivity = Sensitivity::default();
        let result = self.run_pipeline(invocation, &mut sensitivity).await;
        if let Err(error) = &result {
            match error.kind() {
                ErrorKind::Auth => warn!(%error, "invocation denied"),
                ErrorKind::Validation => debug!(%error, "invocation failed validation"),
                ErrorKind::Execution | ErrorKind::Internal => warn!(%error, "invocation failed"),
            }
        }
        Outcome {
            sensitivity,
            result,
        }
    }

    async fn run_pipeline(
        &self,
        invocation: &Invocation,
        sensitivity: &mut Sensitivity,
    ) -> Result<Value, GatewayError> {
        // token_verified
        let claims = self
            .inner
            .verifier
            .check(&invocation.capability_token)
            .map_err(|rejection| GatewayError::InvalidToken(rejection.to_string()))?;
        if CallerId::from(claims.sub.as_str()) != invocation.caller_id {
            return Err(GatewayError::InvalidToken(
                "token subject does not match caller_id".to_owned(),
            ));
        }

        // tool_resolved
        let registry = &self.inner.registry;
        let tool = registry
            .get_tool(&invocation.tool_id)
            .ok_or_else(|| GatewayError::UnknownTool(invocation.tool_id.clone()))?;
        let function = tool.function(&invocation.function_name).ok_or_else(|| {
            GatewayError::UnknownFunction {
                tool: invocation.tool_id.clone(),
                function: invocation.function_name.clone(),
            }
        })?;
        *sensitivity = function.sensitivity;

        let evaluation = evaluate_permissions(&claims.permissions, &tool.required_permissions);
        if !evaluation.is_allowed() {
            return Err(GatewayError::Forbidden {
                missing: evaluation
                    .denied
                    .iter()
                    .map(|permission| permission.as_str().to_owned())
                    .collect(),
            });
        }

        // schema_validated
        let schemas = registry
            .schemas(&tool.id, &function.name)
            .ok_or_else(|| GatewayError::Internal("function schemas missing".to_owned()))?;
        let violations = schemas.input_violations(&invocation.args);
        if !violations.is_empty() {
            return Err(GatewayError::SchemaViolation { violations });
        }

        // executed
        let adapter = registry
            .get_adapter(&tool.id)
            .ok_or_else(|| GatewayError::Internal(format!("no adapter bound to {}", tool.id)))?;
        let ctx = AdapterContext::new(invocation.request_id.clone(), function.timeout())
            .with_dry_run(invocation.dry_run())
            .with_trace_id(invocation.metadata.trace_id.clone());
        let deadline = function.timeout() + self.inner.timeout_grace;

        let result = tokio::time::timeout(
            deadline,
            adapter.run(&function.name, &invocation.args, &ctx),
        )
        .await
        .map_err(|_| GatewayError::Timeout {
            after_ms: function.timeout_ms,
        })??;

        if !result.is_success() {
            return Err(GatewayError::Failed {
                code: result.code,
                output: result.output,
            });
        }
        if !ctx.dry_run {
            let violations = schemas.output_violations(&result.output);
            if !violations.is_empty() {
                return Err(GatewayError::OutputSchema { violations });
            }
        }
        Ok(result.output)
    }

    fn seal(&self, mut response: Response) -> Response {
        match response.signing_payload() {
            Ok(payload) => response.signature = self.inner.signer.sign(&payload),
            Err(error) => warn!(%error, "failed to sign response"),
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use toolgate_audit::{AuditError, AuditEvent, AuditStore, FileAuditStore, InMemoryAuditStore};
    use toolgate_policy::{CapabilityGrant, HmacSigner};
    use toolgate_protocol::{
        AdapterError, AdapterResult, FunctionDefinition, InvocationMetadata, Permission,
        ResponseStatus, ToolAdapter, ToolDefinition,
    };
    use toolgate_sandbox::LocalSandboxRunner;
    use toolgate_tools::catalog::script_runner_tool;
    use toolgate_tools::{
        ConfigPatcherAdapter, CoreAdapters, MetricPoint, MetricsQueryAdapter, PrStatusAdapter,
        ScriptRunnerAdapter, ScriptSpec, StaticMetricsBackend, StaticSourceControl,
    };

    use super::*;
    use crate::GatewayBuilder;

    const SECRET: &[u8] = b"gateway-test-secret-0123456789";

    fn unique_test_root(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("{name}-{}", uuid::Uuid::new_v4()));
        let _ = std::fs::create_dir_all(&root);
        root
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Echo,
        Fail(i32),
        WrongOutput,
        Sleep(Duration),
    }

    /// Counts dispatches and answers according to its behaviour.
    struct RecordingAdapter {
        calls: AtomicUsize,
        behaviour: Behaviour,
    }

    impl RecordingAdapter {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                behaviour,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ToolAdapter for RecordingAdapter {
        async fn run(
            &self,
            _function: &str,
            args: &Value,
            ctx: &AdapterContext,
        ) -> Result<AdapterResult, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Echo => Ok(AdapterResult::success(json!({
                    "pong": args["n"],
                    "dry_run": ctx.dry_run,
                }))),
                Behaviour::Fail(code) => Ok(AdapterResult::failure(code, json!({"log": "boom"}))),
                Behaviour::WrongOutput => Ok(AdapterResult::success(json!({"wrong": true}))),
                Behaviour::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(AdapterResult::success(json!({"pong": 0})))
                }
            }
        }
    }

    /// Store whose writes always fail.
    struct FailingStore;

    #[async_trait]
    impl AuditStore for FailingStore {
        async fn append(&self, _event: &AuditEvent) -> Result<(), AuditError> {
            Err(AuditError::Unavailable("disk full".into()))
        }

        async fn find_by_request(
            &self,
            _request_id: &RequestId,
        ) -> Result<Option<AuditEvent>, AuditError> {
            Ok(None)
        }

        async fn read_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
            Ok(Vec::new())
        }
    }

    /// The script runner under another id, with a short deadline.
    fn quick_scripts_tool() -> ToolDefinition {
        let mut tool = script_runner_tool();
        tool.id = "quick-scripts".into();
        for function in &mut tool.functions {
            function.timeout_ms = 200;
        }
        tool
    }

    fn counter_tool(timeout_ms: u64) -> ToolDefinition {
        ToolDefinition {
            id: "counter".into(),
            name: "Counter".into(),
            description: "test tool".into(),
            functions: vec![FunctionDefinition {
                name: "ping".into(),
                description: "echo n back".into(),
                input_schema: json!({
                    "type": "object",
                    "required": ["n"],
                    "properties": { "n": { "type": "integer" } },
                    "additionalProperties": false
                }),
                output_schema: json!({
                    "type": "object",
                    "required": ["pong"]
                }),
                timeout_ms,
                sensitivity: Sensitivity::Low,
            }],
            required_permissions: vec![Permission::new("counter:use")],
        }
    }

    struct Harness {
        server: InvocationServer,
        store: Arc<dyn AuditStore>,
        counter: Arc<RecordingAdapter>,
        workspace: PathBuf,
    }

    impl Harness {
        fn new(behaviour: Behaviour) -> Result<Self> {
            Self::with_timeout(behaviour, 1_000, DEFAULT_TIMEOUT_GRACE)
        }

        fn with_timeout(behaviour: Behaviour, timeout_ms: u64, grace: Duration) -> Result<Self> {
            Self::build(
                behaviour,
                timeout_ms,
                grace,
                Arc::new(InMemoryAuditStore::default()),
                unique_test_root("toolgate-gateway"),
            )
        }

        fn with_store(store: Arc<dyn AuditStore>, workspace: PathBuf) -> Result<Self> {
            Self::build(Behaviour::Echo, 1_000, DEFAULT_TIMEOUT_GRACE, store, workspace)
        }

        fn build(
            behaviour: Behaviour,
            timeout_ms: u64,
            grace: Duration,
            store: Arc<dyn AuditStore>,
            workspace: PathBuf,
        ) -> Result<Self> {
            std::fs::write(workspace.join("app.json"), r#"{"replicas": 1}"#)?;

            let now = chrono::Utc::now().timestamp();
            let metrics = StaticMetricsBackend::default().with_series(
                "http_latency_ms",
                (1..=20)
                    .map(|i| MetricPoint {
                        timestamp: now - i,
                        value: i as f64,
                    })
                    .collect(),
            );
            let scripts = vec![ScriptSpec::new(
                "forge:benchmark",
                "sh",
                vec!["-c".into(), "touch benchmark.marker".into()],
            )];
            let mut registry = ToolRegistry::with_core_tools(CoreAdapters {
                script_runner: Arc::new(ScriptRunnerAdapter::new(
                    scripts,
                    Arc::new(LocalSandboxRunner::new(vec!["sh".into()])),
                    workspace.clone(),
                )),
                config_patcher: Arc::new(ConfigPatcherAdapter::new(
                    workspace.clone(),
                    vec!["app.json".into()],
                )),
                metrics_query: Arc::new(MetricsQueryAdapter::new(
                    Arc::new(metrics),
                    vec!["http_latency_ms".into()],
                )),
                pr_status: Arc::new(PrStatusAdapter::new(
                    Arc::new(StaticSourceControl::default()),
                    "acme/widgets",
                    vec![],
                )),
            })?;
            let counter = RecordingAdapter::new(behaviour);
            registry.register_with_adapter(counter_tool(timeout_ms), counter.clone())?;
            registry.register_with_adapter(
                quick_scripts_tool(),
                Arc::new(ScriptRunnerAdapter::new(
                    vec![ScriptSpec::new(
                        "forge:detach",
                        "sh",
                        vec!["-c".into(), "(sleep 1; touch after_timeout.marker) & wait".into()],
                    )],
                    Arc::new(LocalSandboxRunner::new(vec!["sh".into()])),
                    workspace.clone(),
                )),
            )?;

            let server = GatewayBuilder::new()
                .registry(registry)
                .signer(Arc::new(HmacSigner::new("k1", SECRET)?))
                .audit_store(store.clone())
                .timeout_grace(grace)
                .build()?;
            Ok(Self {
                server,
                store,
                counter,
                workspace,
            })
        }

        fn token(&self, subject: &str, permissions: &[&str]) -> Result<String> {
            let grant = CapabilityGrant::new(
                subject,
                permissions.iter().map(|p| Permission::new(*p)).collect(),
            );
            Ok(self
                .server
                .verifier()
                .generate_token(&grant, Duration::from_secs(300))?)
        }

        fn invocation(
            &self,
            request_id: &str,
            tool_id: &str,
            function_name: &str,
            args: Value,
        ) -> Result<Invocation> {
            Ok(Invocation {
                request_id: RequestId::from(request_id),
                caller_id: CallerId::from("agent-7"),
                capability_token: self.token("agent-7", &["*"])?,
                tool_id: tool_id.into(),
                function_name: function_name.into(),
                args,
                metadata: InvocationMetadata::default(),
            })
        }

        async fn audit_for(&self, request_id: &str) -> Result<Vec<AuditEvent>> {
            Ok(self
                .store
                .read_all()
                .await?
                .into_iter()
                .filter(|event| event.request_id.as_str() == request_id)
                .collect())
        }

        fn workspace(&self) -> &Path {
            &self.workspace
        }
    }

    fn assert_error(response: &Response, kind: ErrorKind, code: i32) {
        assert_eq!(response.status, ResponseStatus::Error, "{response:?}");
        assert_eq!(response.error_kind(), Some(kind), "{response:?}");
        assert_eq!(response.code, code, "{response:?}");
    }

    #[tokio::test]
    async fn bad_tokens_are_auth_errors_and_never_dispatch() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let foreign = CapabilityVerifier::new(Arc::new(HmacSigner::new(
            "k1",
            b"some-other-secret-0123456789",
        )?))
        .generate_token(
            &CapabilityGrant::new("agent-7", vec![Permission::new("*")]),
            Duration::from_secs(300),
        )?;
        let expired = harness.server.verifier().generate_token_at(
            &CapabilityGrant::new("agent-7", vec![Permission::new("*")]),
            Duration::from_secs(60),
            chrono::Utc::now() - chrono::Duration::seconds(600),
        )?;
        let wrong_subject = harness.token("someone-else", &["*"])?;

        for (index, token) in ["garbage".to_owned(), foreign, expired, wrong_subject]
            .into_iter()
            .enumerate()
        {
            let request_id = format!("req-auth-{index}");
            let mut invocation =
                harness.invocation(&request_id, "counter", "ping", json!({"n": 1}))?;
            invocation.capability_token = token;
            let response = harness.server.invoke(invocation).await;

            assert_error(&response, ErrorKind::Auth, 403);
            let audited = harness.audit_for(&request_id).await?;
            assert_eq!(audited.len(), 1);
            assert_eq!(audited[0].result_code, 403);
        }
        assert_eq!(harness.counter.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_tools_and_functions_are_validation_errors() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let unknown_tool = harness
            .server
            .invoke(harness.invocation("req-v1", "nope", "ping", json!({}))?)
            .await;
        assert_error(&unknown_tool, ErrorKind::Validation, 400);

        let unknown_function = harness
            .server
            .invoke(harness.invocation("req-v2", "counter", "pong", json!({}))?)
            .await;
        assert_error(&unknown_function, ErrorKind::Validation, 400);
        assert_eq!(harness.counter.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_permissions_are_denied_before_dispatch() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let mut invocation = harness.invocation("req-p1", "counter", "ping", json!({"n": 1}))?;
        invocation.capability_token = harness.token("agent-7", &["metrics:read"])?;
        let response = harness.server.invoke(invocation).await;

        assert_error(&response, ErrorKind::Auth, 403);
        let details = response.error.as_ref().and_then(|e| e.details.clone());
        assert_eq!(
            details.map(|d| d["missing_permissions"].clone()),
            Some(json!(["counter:use"]))
        );
        assert_eq!(harness.counter.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn schema_violations_carry_details() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let response = harness
            .server
            .invoke(harness.invocation("req-s1", "counter", "ping", json!({"n": "one"}))?)
            .await;

        assert_error(&response, ErrorKind::Validation, 400);
        let violations = response
            .error
            .as_ref()
            .and_then(|e| e.details.as_ref())
            .and_then(|d| d["violations"].as_array().cloned())
            .unwrap_or_default();
        assert!(!violations.is_empty());
        assert_eq!(harness.counter.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn dry_run_script_reports_without_running() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let mut invocation = harness.invocation(
            "req-d1",
            "script-runner",
            "run_script",
            json!({"script_name": "forge:benchmark"}),
        )?;
        invocation.metadata.dry_run = true;
        let response = harness.server.invoke(invocation).await;

        assert!(response.is_ok(), "{response:?}");
        assert_eq!(response.code, 0);
        let message = response
            .output
            .as_ref()
            .and_then(|o| o["message"].as_str())
            .unwrap_or_default()
            .to_owned();
        assert!(message.contains("Would run"), "{message}");
        assert!(!harness.workspace().join("benchmark.marker").exists());

        let audited = harness.audit_for("req-d1").await?;
        assert_eq!(audited.len(), 1);
        assert!(audited[0].dry_run);
        assert_eq!(audited[0].result_code, 0);
        Ok(())
    }

    #[tokio::test]
    async fn dry_run_config_patch_leaves_file_alone() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let before = std::fs::read_to_string(harness.workspace().join("app.json"))?;
        let mut invocation = harness.invocation(
            "req-d2",
            "config-patcher",
            "set_key",
            json!({"path": "app.json", "key": "replicas", "value": 5}),
        )?;
        invocation.metadata.dry_run = true;
        let response = harness.server.invoke(invocation).await;

        assert_eq!(response.code, 0);
        assert_eq!(
            std::fs::read_to_string(harness.workspace().join("app.json"))?,
            before
        );
        Ok(())
    }

    #[tokio::test]
    async fn script_outside_allow_list_is_an_execution_error() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let response = harness
            .server
            .invoke(harness.invocation(
                "req-x1",
                "script-runner",
                "run_script",
                json!({"script_name": "not-on-list"}),
            )?)
            .await;

        assert_error(&response, ErrorKind::Execution, 500);
        let error = response.error.as_ref().map(|e| e.message.clone()).unwrap_or_default();
        assert!(error.contains("not allowed"), "{error}");
        assert_eq!(
            response.error.as_ref().and_then(|e| e.details.clone()),
            Some(json!({"adapter_error": "not_allowed"}))
        );
        assert_eq!(harness.audit_for("req-x1").await?[0].result_code, 500);
        Ok(())
    }

    #[tokio::test]
    async fn config_path_outside_allow_list_is_an_execution_error() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let response = harness
            .server
            .invoke(harness.invocation(
                "req-x2",
                "config-patcher",
                "set_key",
                json!({"path": "unknown.json", "key": "a", "value": 1}),
            )?)
            .await;

        assert_error(&response, ErrorKind::Execution, 500);
        let message = response.error.as_ref().map(|e| e.message.clone()).unwrap_or_default();
        assert!(message.contains("path not allowed"), "{message}");
        Ok(())
    }

    #[tokio::test]
    async fn config_patch_applies_and_returns_change_id() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let response = harness
            .server
            .invoke(harness.invocation(
                "req-c1",
                "config-patcher",
                "merge_patch",
                json!({"path": "app.json", "patch": {"replicas": 3}}),
            )?)
            .await;

        assert!(response.is_ok(), "{response:?}");
        let output = response.output.clone().unwrap_or_default();
        assert!(output["change_id"].as_str().unwrap_or_default().starts_with("chg-"));
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(harness.workspace().join("app.json"))?)?;
        assert_eq!(written["replicas"], 3);

        let audited = harness.audit_for("req-c1").await?;
        assert_eq!(audited[0].args["redacted"], true);
        Ok(())
    }

    #[tokio::test]
    async fn metric_query_returns_summary_statistics() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let response = harness
            .server
            .invoke(harness.invocation(
                "req-m1",
                "metrics-query",
                "query_metric",
                json!({"metric_name": "http_latency_ms", "window": "5m"}),
            )?)
            .await;

        assert!(response.is_ok(), "{response:?}");
        let summary = response
            .output
            .as_ref()
            .map(|o| o["summary"].clone())
            .unwrap_or_default();
        for field in ["min", "max", "p50", "p95", "p99"] {
            assert!(summary[field].is_number(), "{field} missing in {summary}");
        }
        assert_eq!(summary["count"], 20);
        Ok(())
    }

    #[tokio::test]
    async fn every_dispatched_invocation_is_audited_exactly_once() -> Result<()> {
        let ok = Harness::new(Behaviour::Echo)?;
        let failing = Harness::new(Behaviour::Fail(3))?;

        for (harness, request_id) in [(&ok, "req-a1"), (&failing, "req-a2")] {
            let response = harness
                .server
                .invoke(harness.invocation(request_id, "counter", "ping", json!({"n": 7}))?)
                .await;
            let audited = harness.audit_for(request_id).await?;
            assert_eq!(audited.len(), 1);
            assert_eq!(audited[0].result_code, response.code);
            assert_eq!(audited[0].error_kind, response.error_kind());
            assert!(harness.server.audit().verify(&audited[0]));
        }
        Ok(())
    }

    #[tokio::test]
    async fn nonzero_adapter_result_is_an_execution_error() -> Result<()> {
        let harness = Harness::new(Behaviour::Fail(3))?;
        let response = harness
            .server
            .invoke(harness.invocation("req-f1", "counter", "ping", json!({"n": 1}))?)
            .await;

        assert_error(&response, ErrorKind::Execution, 500);
        let details = response.error.as_ref().and_then(|e| e.details.clone()).unwrap_or_default();
        assert_eq!(details["result_code"], 3);
        assert_eq!(details["adapter_error"], "nonzero_result");
        Ok(())
    }

    #[tokio::test]
    async fn slow_adapter_times_out_as_execution_error() -> Result<()> {
        let harness = Harness::with_timeout(
            Behaviour::Sleep(Duration::from_secs(5)),
            50,
            Duration::from_millis(10),
        )?;
        let response = harness
            .server
            .invoke(harness.invocation("req-t1", "counter", "ping", json!({"n": 1}))?)
            .await;

        assert_error(&response, ErrorKind::Execution, 500);
        assert_eq!(
            response.error.as_ref().and_then(|e| e.details.clone()),
            Some(json!({"adapter_error": "timeout", "timeout_ms": 50}))
        );
        assert_eq!(harness.audit_for("req-t1").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn output_schema_violation_is_internal() -> Result<()> {
        let harness = Harness::new(Behaviour::WrongOutput)?;
        let response = harness
            .server
            .invoke(harness.invocation("req-o1", "counter", "ping", json!({"n": 1}))?)
            .await;
        assert_error(&response, ErrorKind::Internal, 500);
        Ok(())
    }

    #[tokio::test]
    async fn replayed_request_ids_are_rejected() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let first = harness
            .server
            .invoke(harness.invocation("req-r1", "counter", "ping", json!({"n": 1}))?)
            .await;
        let replay = harness
            .server
            .invoke(harness.invocation("req-r1", "counter", "ping", json!({"n": 2}))?)
            .await;

        assert!(first.is_ok());
        assert_error(&replay, ErrorKind::Validation, 409);
        assert_eq!(harness.counter.calls(), 1);
        assert_eq!(harness.audit_for("req-r1").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn audit_lookup_is_idempotent() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        harness
            .server
            .invoke(harness.invocation("req-i1", "counter", "ping", json!({"n": 1}))?)
            .await;

        let request_id = RequestId::from("req-i1");
        let first = harness.server.audit().find(&request_id).await?;
        let second = harness.server.audit().find(&request_id).await?;
        assert!(first.is_some());
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn audit_write_failure_is_internal() -> Result<()> {
        let mut registry = ToolRegistry::default();
        let counter = RecordingAdapter::new(Behaviour::Echo);
        registry.register_with_adapter(counter_tool(1_000), counter.clone())?;
        let server = GatewayBuilder::new()
            .registry(registry)
            .signer(Arc::new(HmacSigner::new("k1", SECRET)?))
            .audit_store(Arc::new(FailingStore))
            .build()?;
        let token = server.verifier().generate_token(
            &CapabilityGrant::new("agent-7", vec![Permission::new("counter:use")]),
            Duration::from_secs(60),
        )?;

        let response = server
            .invoke(Invocation {
                request_id: RequestId::from("req-w1"),
                caller_id: CallerId::from("agent-7"),
                capability_token: token,
                tool_id: "counter".into(),
                function_name: "ping".into(),
                args: json!({"n": 1}),
                metadata: InvocationMetadata::default(),
            })
            .await;

        assert_error(&response, ErrorKind::Internal, 500);
        assert!(server.verify_response(&response));
        Ok(())
    }

    #[tokio::test]
    async fn responses_are_signed() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let mut response = harness
            .server
            .invoke(harness.invocation("req-g1", "counter", "ping", json!({"n": 1}))?)
            .await;

        assert!(response.signature.starts_with("k1:"));
        assert!(harness.server.verify_response(&response));
        response.code = 1;
        assert!(!harness.server.verify_response(&response));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_bodies_are_rejected_without_audit() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let response = harness
            .server
            .invoke_value(json!({"request_id": "req-b1", "caller_id": 5}))
            .await;

        assert_error(&response, ErrorKind::Validation, 400);
        assert_eq!(response.request_id.as_str(), "req-b1");

        let not_json = harness.server.invoke_bytes(b"{not json").await;
        assert_error(&not_json, ErrorKind::Validation, 400);
        assert!(harness.server.verify_response(&not_json));
        assert!(harness.store.read_all().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn torn_audit_tail_does_not_block_later_invocations() -> Result<()> {
        let data_dir = unique_test_root("toolgate-torn-audit");
        let workspace = unique_test_root("toolgate-torn-workspace");
        let store = Arc::new(FileAuditStore::new(&data_dir));
        let harness = Harness::with_store(store.clone(), workspace.clone())?;

        let first = harness
            .server
            .invoke(harness.invocation("req-torn-1", "counter", "ping", json!({"n": 1}))?)
            .await;
        assert!(first.is_ok(), "{first:?}");

        // A crash mid-append leaves half a record behind.
        let mut raw = std::fs::OpenOptions::new().append(true).open(store.path())?;
        std::io::Write::write_all(&mut raw, br#"{"event_id":"evt-x","requ"#)?;
        drop(raw);

        let second = harness
            .server
            .invoke(harness.invocation("req-torn-2", "counter", "ping", json!({"n": 2}))?)
            .await;
        assert!(second.is_ok(), "{second:?}");
        assert_eq!(harness.audit_for("req-torn-2").await?.len(), 1);

        // A gateway started over the same log finds it intact.
        let mut raw = std::fs::OpenOptions::new().append(true).open(store.path())?;
        std::io::Write::write_all(&mut raw, br#"{"event_id":"evt-y"#)?;
        drop(raw);
        let restarted = Harness::with_store(Arc::new(FileAuditStore::new(&data_dir)), workspace)?;
        let third = restarted
            .server
            .invoke(restarted.invocation("req-torn-3", "counter", "ping", json!({"n": 3}))?)
            .await;
        assert!(third.is_ok(), "{third:?}");
        let replay = restarted
            .server
            .invoke(restarted.invocation("req-torn-1", "counter", "ping", json!({"n": 1}))?)
            .await;
        assert_error(&replay, ErrorKind::Validation, 409);

        let ids: Vec<String> = restarted
            .store
            .read_all()
            .await?
            .into_iter()
            .map(|event| event.request_id.to_string())
            .collect();
        assert_eq!(ids, ["req-torn-1", "req-torn-2", "req-torn-3"]);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_config_patches_all_land() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let mut tasks = tokio::task::JoinSet::new();
        for index in 0..16 {
            let server = harness.server.clone();
            let invocation = harness.invocation(
                &format!("req-cc-{index}"),
                "config-patcher",
                "set_key",
                json!({"path": "app.json", "key": format!("limits.k{index}"), "value": index}),
            )?;
            tasks.spawn(async move { server.invoke(invocation).await });
        }
        while let Some(response) = tasks.join_next().await {
            let response = response?;
            assert!(response.is_ok(), "{response:?}");
        }

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(harness.workspace().join("app.json"))?)?;
        assert_eq!(written["replicas"], 1);
        for index in 0..16 {
            assert_eq!(written["limits"][format!("k{index}")], index, "k{index} lost");
        }
        Ok(())
    }

    #[tokio::test]
    async fn script_timeout_stops_background_descendants() -> Result<()> {
        let harness = Harness::new(Behaviour::Echo)?;
        let response = harness
            .server
            .invoke(harness.invocation(
                "req-detach",
                "quick-scripts",
                "run_script",
                json!({"script_name": "forge:detach"}),
            )?)
            .await;

        assert_error(&response, ErrorKind::Execution, 500);
        assert_eq!(harness.audit_for("req-detach").await?.len(), 1);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!harness.workspace().join("after_timeout.marker").exists());
        Ok(())
    }
}
