use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toolgate_policy::PolicyError;
use toolgate_tools::ScriptSpec;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path:?}")]
    NotFound { path: PathBuf },

    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },

    #[error("environment variable {var} is not set or empty")]
    MissingSecret { var: String },

    #[error("{section}: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },

    #[error("invalid signing key: {0}")]
    Key(#[from] PolicyError),
}

/// Gateway configuration, loaded from TOML.
///
/// Secrets are never stored in the file; each section names the environment
/// variable that holds them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub config_patcher: ConfigPatcherConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub source_control: SourceControlConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            signing: SigningConfig::default(),
            tokens: TokenConfig::default(),
            scripts: ScriptsConfig::default(),
            config_patcher: ConfigPatcherConfig::default(),
            metrics: MetricsConfig::default(),
            source_control: SourceControlConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRef {
    pub key_id: String,
    pub secret_env: String,
}

/// Key used for responses and audit records, plus retired keys kept for verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(default = "default_key_id")]
    pub key_id: String,
    #[serde(default = "default_signing_secret_env")]
    pub secret_env: String,
    #[serde(default)]
    pub retired: Vec<KeyRef>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_id: default_key_id(),
            secret_env: default_signing_secret_env(),
            retired: Vec::new(),
        }
    }
}

/// Capability token keys. Without `secret_env` tokens share the signing key ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub secret_env: Option<String>,
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            key_id: None,
            secret_env: None,
            default_ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptsConfig {
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    #[serde(default = "default_inherit_env")]
    pub inherit_env: Vec<String>,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub allow: Vec<ScriptSpec>,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            inherit_env: default_inherit_env(),
            max_output_bytes: default_max_output_bytes(),
            allow: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPatcherConfig {
    #[serde(default = "default_workdir")]
    pub root: PathBuf,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
}

impl Default for ConfigPatcherConfig {
    fn default() -> Self {
        Self {
            root: default_workdir(),
            allowed_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsBackendKind {
    #[default]
    Static,
    Prometheus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub backend: MetricsBackendKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub allowed_metrics: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceControlBackendKind {
    #[default]
    Static,
    Github,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceControlConfig {
    #[serde(default)]
    pub backend: SourceControlBackendKind,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub token_env: Option<String>,
    /// Check names callers may query; empty allows any.
    #[serde(default)]
    pub allowed_checks: Vec<String>,
}

impl Default for SourceControlConfig {
    fn default() -> Self {
        Self {
            backend: SourceControlBackendKind::default(),
            api_base: default_api_base(),
            repository: String::new(),
            token_env: None,
            allowed_checks: Vec::new(),
        }
    }
}

/// HTTP front end settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Browser origins allowed to call the API cross-origin. Empty disables CORS.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "reading gateway configuration");
        let content = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics.backend == MetricsBackendKind::Prometheus
            && self.metrics.base_url.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::Invalid {
                section: "metrics",
                message: "the prometheus backend requires base_url".to_owned(),
            });
        }
        if self.source_control.backend == SourceControlBackendKind::Github
            && !self.source_control.repository.contains('/')
        {
            return Err(ConfigError::Invalid {
                section: "source_control",
                message: "the github backend requires repository = \"owner/name\"".to_owned(),
            });
        }
        if let Some(origin) = self.http.allowed_origins.iter().find(|origin| !is_origin(origin)) {
            return Err(ConfigError::Invalid {
                section: "http",
                message: format!("{origin:?} is not an origin like https://ops.example.com"),
            });
        }
        let mut names: Vec<&str> = self.scripts.allow.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::Invalid {
                section: "scripts",
                message: format!("script {} is listed more than once", pair[0]),
            });
        }
        Ok(())
    }
}

/// Read a secret from the named environment variable.
pub fn read_secret(var: &str) -> Result<Vec<u8>, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value.into_bytes()),
        _ => Err(ConfigError::MissingSecret {
            var: var.to_owned(),
        }),
    }
}

/// `scheme://host[:port]` with nothing after the authority.
fn is_origin(value: &str) -> bool {
    let Some((scheme, authority)) = value.split_once("://") else {
        return false;
    };
    matches!(scheme, "http" | "https")
        && !authority.is_empty()
        && !authority.contains(['/', '*', '?', '#'])
        && authority.chars().all(|c| c.is_ascii_graphic())
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".toolgate")
}

fn default_key_id() -> String {
    "k1".to_owned()
}

fn default_signing_secret_env() -> String {
    "TOOLGATE_SIGNING_SECRET".to_owned()
}

fn default_ttl_secs() -> u64 {
    900
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}

fn default_inherit_env() -> Vec<String> {
    vec!["PATH".to_owned(), "HOME".to_owned(), "LANG".to_owned()]
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_api_base() -> String {
    "https://api.github.com".to_owned()
}
