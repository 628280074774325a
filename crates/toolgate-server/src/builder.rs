use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use toolgate_audit::{AuditHub, AuditLogger, AuditStore, FileAuditStore};
use toolgate_policy::{CapabilityVerifier, HmacSigner};
use toolgate_protocol::Signer;
use toolgate_sandbox::LocalSandboxRunner;
use toolgate_tools::{
    ConfigPatcherAdapter, CoreAdapters, GitHubChecksBackend, MetricsBackend, MetricsQueryAdapter,
    PrStatusAdapter, PrometheusBackend, RegistryError, ScriptRunnerAdapter, SourceControlBackend,
    StaticMetricsBackend, StaticSourceControl, ToolRegistry,
};
use tracing::info;

use crate::config::{
    ConfigError, GatewayConfig, MetricsBackendKind, SourceControlBackendKind, read_secret,
};
use crate::server::{DEFAULT_TIMEOUT_GRACE, InvocationServer};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no tool registry configured")]
    MissingRegistry,
    #[error("no signer configured")]
    MissingSigner,
    #[error("no audit store configured")]
    MissingAuditStore,
    #[error("invalid tool registry: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Signing keys resolved from configuration and the environment.
#[derive(Clone)]
pub struct GatewaySigners {
    /// Signs responses and audit records.
    pub records: Arc<dyn Signer>,
    /// Signs and verifies capability tokens.
    pub tokens: Arc<dyn Signer>,
}

impl GatewaySigners {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let signing = &config.signing;
        let mut records = HmacSigner::new(&signing.key_id, &read_secret(&signing.secret_env)?)?;
        for retired in &signing.retired {
            records = records.with_retired_key(&retired.key_id, &read_secret(&retired.secret_env)?)?;
        }
        let records: Arc<dyn Signer> = Arc::new(records);

        let tokens: Arc<dyn Signer> = match &config.tokens.secret_env {
            Some(var) => {
                let key_id = config.tokens.key_id.as_deref().unwrap_or("tokens");
                Arc::new(HmacSigner::new(key_id, &read_secret(var)?)?)
            }
            None => records.clone(),
        };
        Ok(Self { records, tokens })
    }

    pub fn verifier(&self) -> CapabilityVerifier {
        CapabilityVerifier::new(self.tokens.clone())
    }
}

/// Assembles an [`InvocationServer`] from its parts.
pub struct GatewayBuilder {
    registry: Option<ToolRegistry>,
    signer: Option<Arc<dyn Signer>>,
    token_signer: Option<Arc<dyn Signer>>,
    audit_store: Option<Arc<dyn AuditStore>>,
    audit_hub: AuditHub,
    timeout_grace: Duration,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self {
            registry: None,
            signer: None,
            token_signer: None,
            audit_store: None,
            audit_hub: AuditHub::default(),
            timeout_grace: DEFAULT_TIMEOUT_GRACE,
        }
    }
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything the configuration describes: core tools wired to their
    /// configured backends, keys from the environment, and the file audit store.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, BuildError> {
        let signers = GatewaySigners::from_config(config)?;
        let registry = ToolRegistry::with_core_tools(core_adapters(config)?)?;
        Ok(Self::new()
            .registry(registry)
            .signer(signers.records)
            .token_signer(signers.tokens)
            .audit_store(Arc::new(FileAuditStore::new(&config.data_dir))))
    }

    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Signer for responses and audit records; also used for tokens unless
    /// [`GatewayBuilder::token_signer`] is set.
    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn token_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.token_signer = Some(signer);
        self
    }

    pub fn audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = Some(store);
        self
    }

    pub fn audit_hub(mut self, hub: AuditHub) -> Self {
        self.audit_hub = hub;
        self
    }

    pub fn timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace = grace;
        self
    }

    pub fn build(self) -> Result<InvocationServer, BuildError> {
        let registry = self.registry.ok_or(BuildError::MissingRegistry)?;
        registry.validate()?;
        let signer = self.signer.ok_or(BuildError::MissingSigner)?;
        let token_signer = self.token_signer.unwrap_or_else(|| signer.clone());
        let store = self.audit_store.ok_or(BuildError::MissingAuditStore)?;

        info!(
            tools = registry.len(),
            key_id = signer.key_id(),
            "invocation server ready"
        );
        Ok(InvocationServer::new(
            Arc::new(registry),
            CapabilityVerifier::new(token_signer),
            signer.clone(),
            AuditLogger::new(store, signer, self.audit_hub),
            self.timeout_grace,
        ))
    }
}

fn core_adapters(config: &GatewayConfig) -> Result<CoreAdapters, ConfigError> {
    let scripts = &config.scripts;
    let commands = scripts
        .allow
        .iter()
        .map(|spec| spec.command.clone())
        .collect::<Vec<_>>();
    let sandbox = LocalSandboxRunner::new(commands).with_inherited_env(scripts.inherit_env.clone());
    let script_runner = ScriptRunnerAdapter::new(
        scripts.allow.clone(),
        Arc::new(sandbox),
        scripts.workdir.clone(),
    )
    .with_max_output_bytes(scripts.max_output_bytes);

    let config_patcher = ConfigPatcherAdapter::new(
        config.config_patcher.root.clone(),
        config.config_patcher.allowed_paths.clone(),
    );

    let metrics_backend: Arc<dyn MetricsBackend> = match config.metrics.backend {
        MetricsBackendKind::Static => Arc::new(StaticMetricsBackend::default()),
        MetricsBackendKind::Prometheus => Arc::new(PrometheusBackend::new(
            config.metrics.base_url.clone().unwrap_or_default(),
        )),
    };

    let scm = &config.source_control;
    let scm_backend: Arc<dyn SourceControlBackend> = match scm.backend {
        SourceControlBackendKind::Static => Arc::new(StaticSourceControl::default()),
        SourceControlBackendKind::Github => {
            let token = match &scm.token_env {
                Some(var) => Some(String::from_utf8_lossy(&read_secret(var)?).into_owned()),
                None => None,
            };
            Arc::new(GitHubChecksBackend::new(
                scm.api_base.clone(),
                scm.repository.clone(),
                token,
            ))
        }
    };

    Ok(CoreAdapters {
        script_runner: Arc::new(script_runner),
        config_patcher: Arc::new(config_patcher),
        metrics_query: Arc::new(MetricsQueryAdapter::new(
            metrics_backend,
            config.metrics.allowed_metrics.clone(),
        )),
        pr_status: Arc::new(PrStatusAdapter::new(
            scm_backend,
            scm.repository.clone(),
            scm.allowed_checks.clone(),
        )),
    })
}
