use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use toolgate_protocol::{AdapterContext, AdapterError, AdapterResult, ToolAdapter};
use tracing::{debug, instrument, warn};

use super::{dry_run_result, parse_args};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Success,
    Failure,
    Pending,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub state: CheckState,
    pub detail: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl CheckReport {
    pub fn new(state: CheckState, detail: impl Into<String>) -> Self {
        Self {
            state,
            detail: detail.into(),
            url: None,
        }
    }

    fn not_found(change_id: &str, check_name: &str) -> Self {
        Self::new(
            CheckState::NotFound,
            format!("no check named {check_name} on change {change_id}"),
        )
    }
}

/// Source-control system holding pull requests and their checks.
#[async_trait]
pub trait SourceControlBackend: Send + Sync {
    async fn check_status(
        &self,
        change_id: &str,
        check_name: &str,
    ) -> Result<CheckReport, AdapterError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticSourceControl {
    checks: HashMap<(String, String), CheckReport>,
}

impl StaticSourceControl {
    pub fn with_check(
        mut self,
        change_id: impl Into<String>,
        check_name: impl Into<String>,
        report: CheckReport,
    ) -> Self {
        self.checks
            .insert((change_id.into(), check_name.into()), report);
        self
    }
}

#[async_trait]
impl SourceControlBackend for StaticSourceControl {
    async fn check_status(
        &self,
        change_id: &str,
        check_name: &str,
    ) -> Result<CheckReport, AdapterError> {
        Ok(self
            .checks
            .get(&(change_id.to_owned(), check_name.to_owned()))
            .cloned()
            .unwrap_or_else(|| CheckReport::not_found(change_id, check_name)))
    }
}

/// GitHub REST checks API for one repository (`owner/name`).
#[derive(Debug, Clone)]
pub struct GitHubChecksBackend {
    client: reqwest::Client,
    api_base: String,
    repository: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    head: PullRequestHead,
}

#[derive(Debug, Deserialize)]
struct PullRequestHead {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CheckRunList {
    #[serde(default)]
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Clone, Deserialize)]
struct CheckRun {
    name: String,
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

impl GitHubChecksBackend {
    pub fn new(
        api_base: impl Into<String>,
        repository: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_owned(),
            repository: repository.into(),
            token,
        }
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(url)
            .header(USER_AGENT, "toolgate")
            .header(ACCEPT, "application/vnd.github+json");
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn head_sha(&self, change_id: &str) -> Result<Option<String>, AdapterError> {
        let response = self
            .get(format!(
                "{}/repos/{}/pulls/{change_id}",
                self.api_base, self.repository
            ))
            .send()
            .await
            .map_err(backend_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let pull: PullRequest = response
            .error_for_status()
            .map_err(backend_error)?
            .json()
            .await
            .map_err(backend_error)?;
        Ok(Some(pull.head.sha))
    }
}

fn backend_error(err: reqwest::Error) -> AdapterError {
    AdapterError::Backend(err.to_string())
}

fn report_from_check_runs(change_id: &str, check_name: &str, runs: &[CheckRun]) -> CheckReport {
    let Some(run) = runs.iter().find(|run| run.name == check_name) else {
        return CheckReport::not_found(change_id, check_name);
    };
    let (state, detail) = if run.status != "completed" {
        (CheckState::Pending, format!("check is {}", run.status))
    } else {
        match run.conclusion.as_deref() {
            Some(conclusion @ ("success" | "neutral" | "skipped")) => {
                (CheckState::Success, format!("completed: {conclusion}"))
            }
            Some(conclusion) => (CheckState::Failure, format!("completed: {conclusion}")),
            None => (CheckState::Pending, "completed without conclusion".to_owned()),
        }
    };
    CheckReport {
        state,
        detail,
        url: run.html_url.clone(),
    }
}

#[async_trait]
impl SourceControlBackend for GitHubChecksBackend {
    #[instrument(skip(self), fields(repository = %self.repository))]
    async fn check_status(
        &self,
        change_id: &str,
        check_name: &str,
    ) -> Result<CheckReport, AdapterError> {
        let Some(sha) = self.head_sha(change_id).await? else {
            return Ok(CheckReport::new(
                CheckState::NotFound,
                format!("change {change_id} not found in {}", self.repository),
            ));
        };
        let runs: CheckRunList = self
            .get(format!(
                "{}/repos/{}/commits/{sha}/check-runs",
                self.api_base, self.repository
            ))
            .query(&[("check_name", check_name)])
            .send()
            .await
            .map_err(backend_error)?
            .error_for_status()
            .map_err(backend_error)?
            .json()
            .await
            .map_err(backend_error)?;
        Ok(report_from_check_runs(change_id, check_name, &runs.check_runs))
    }
}

#[derive(Debug, Deserialize)]
struct CheckStatusArgs {
    change_id: String,
    check_name: String,
}

pub struct PrStatusAdapter {
    backend: Arc<dyn SourceControlBackend>,
    repository: String,
    allowed_checks: Vec<String>,
}

impl PrStatusAdapter {
    /// An empty `allowed_checks` permits any check name in the repository.
    pub fn new(
        backend: Arc<dyn SourceControlBackend>,
        repository: impl Into<String>,
        allowed_checks: Vec<String>,
    ) -> Self {
        Self {
            backend,
            repository: repository.into(),
            allowed_checks,
        }
    }

    #[instrument(skip(self, args, ctx), fields(request_id = %ctx.request_id))]
    async fn check_status(
        &self,
        args: &Value,
        ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError> {
        let CheckStatusArgs {
            change_id,
            check_name,
        } = parse_args(args)?;
        if !self.allowed_checks.is_empty()
            && !self.allowed_checks.iter().any(|allowed| allowed == &check_name)
        {
            warn!(check = %check_name, "check refused by allow-list");
            return Err(AdapterError::not_allowed(format!(
                "check not allowed: {check_name}"
            )));
        }

        if ctx.dry_run {
            let mut extra = Map::new();
            extra.insert("change_id".to_owned(), json!(change_id));
            extra.insert("check_name".to_owned(), json!(check_name));
            extra.insert("repository".to_owned(), json!(self.repository));
            return Ok(dry_run_result(
                format!(
                    "Would check {check_name} on change {change_id} in {}",
                    self.repository
                ),
                extra,
            ));
        }

        let report = self.backend.check_status(&change_id, &check_name).await?;
        debug!(state = ?report.state, "check status resolved");
        Ok(AdapterResult::success(json!({
            "change_id": change_id,
            "check_name": check_name,
            "repository": self.repository,
            "status": report.state,
            "detail": report.detail,
            "url": report.url,
        })))
    }
}

#[async_trait]
impl ToolAdapter for PrStatusAdapter {
    async fn run(
        &self,
        function: &str,
        args: &Value,
        ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError> {
        match function {
            "check_status" => self.check_status(args, ctx).await,
            other => Err(AdapterError::UnknownFunction(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use toolgate_protocol::RequestId;

    fn ctx() -> AdapterContext {
        AdapterContext::new(RequestId::from_string("req-scm"), Duration::from_secs(5))
    }

    fn adapter(allowed_checks: Vec<String>) -> PrStatusAdapter {
        let backend = StaticSourceControl::default().with_check(
            "42",
            "ci/build",
            CheckReport::new(CheckState::Failure, "completed: failure"),
        );
        PrStatusAdapter::new(Arc::new(backend), "acme/widgets", allowed_checks)
    }

    fn run(name: &str, status: &str, conclusion: Option<&str>) -> CheckRun {
        CheckRun {
            name: name.to_owned(),
            status: status.to_owned(),
            conclusion: conclusion.map(str::to_owned),
            html_url: Some(format!("https://example.test/{name}")),
        }
    }

    #[tokio::test]
    async fn reports_known_and_missing_checks() -> anyhow::Result<()> {
        let adapter = adapter(vec![]);
        let known = adapter
            .run("check_status", &json!({"change_id": "42", "check_name": "ci/build"}), &ctx())
            .await?;
        assert_eq!(known.output["status"], "failure");

        let missing = adapter
            .run("check_status", &json!({"change_id": "42", "check_name": "lint"}), &ctx())
            .await?;
        assert!(missing.is_success());
        assert_eq!(missing.output["status"], "not_found");
        Ok(())
    }

    #[tokio::test]
    async fn check_allow_list_is_enforced() {
        let error = adapter(vec!["ci/build".into()])
            .run("check_status", &json!({"change_id": "42", "check_name": "deploy"}), &ctx())
            .await
            .unwrap_err();
        assert_eq!(error.kind(), "not_allowed");
    }

    #[test]
    fn check_runs_map_onto_states() {
        let runs = vec![
            run("ci/build", "completed", Some("success")),
            run("ci/test", "in_progress", None),
            run("ci/lint", "completed", Some("failure")),
        ];
        assert_eq!(
            report_from_check_runs("7", "ci/build", &runs).state,
            CheckState::Success
        );
        assert_eq!(
            report_from_check_runs("7", "ci/test", &runs).state,
            CheckState::Pending
        );
        let lint = report_from_check_runs("7", "ci/lint", &runs);
        assert_eq!(lint.state, CheckState::Failure);
        assert_eq!(lint.url.as_deref(), Some("https://example.test/ci/lint"));
        assert_eq!(
            report_from_check_runs("7", "ci/deploy", &runs).state,
            CheckState::NotFound
        );
    }
}
