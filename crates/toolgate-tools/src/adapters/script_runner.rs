use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use toolgate_protocol::{AdapterContext, AdapterError, AdapterResult, ToolAdapter};
use toolgate_sandbox::{SandboxExecution, SandboxLimits, SandboxRequest, SandboxRunner};
use tracing::{debug, instrument, warn};

use super::{dry_run_result, parse_args};

/// Result code reported when a script outlives its function timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Result code reported when a script is terminated by a signal.
pub const SIGNAL_EXIT_CODE: i32 = -1;

/// An allow-listed script: the name callers use and the command it maps to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ScriptSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunScriptArgs {
    script_name: String,
    #[serde(default)]
    args: Vec<String>,
}

pub struct ScriptRunnerAdapter {
    scripts: IndexMap<String, ScriptSpec>,
    sandbox: Arc<dyn SandboxRunner>,
    workdir: PathBuf,
    max_output_bytes: usize,
}

impl ScriptRunnerAdapter {
    pub fn new(
        scripts: impl IntoIterator<Item = ScriptSpec>,
        sandbox: Arc<dyn SandboxRunner>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
            sandbox,
            workdir: workdir.into(),
            max_output_bytes: SandboxLimits::default().max_output_bytes,
        }
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn script_names(&self) -> impl Iterator<Item = &str> {
        self.scripts.keys().map(String::as_str)
    }

    #[instrument(skip(self, args, ctx), fields(request_id = %ctx.request_id))]
    async fn run_script(
        &self,
        args: &Value,
        ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError> {
        let args: RunScriptArgs = parse_args(args)?;
        let Some(spec) = self.scripts.get(&args.script_name) else {
            warn!(script = %args.script_name, "script refused by allow-list");
            return Err(AdapterError::not_allowed(format!(
                "script not allowed: {}",
                args.script_name
            )));
        };

        let mut argv = spec.args.clone();
        argv.extend(args.args);

        if ctx.dry_run {
            let command_line = std::iter::once(spec.command.as_str())
                .chain(argv.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            let mut extra = Map::new();
            extra.insert("script_name".to_owned(), json!(spec.name));
            extra.insert("command".to_owned(), json!(spec.command));
            extra.insert("args".to_owned(), json!(argv));
            return Ok(dry_run_result(
                format!("Would run {}: {command_line}", spec.name),
                extra,
            ));
        }

        let mut env = BTreeMap::new();
        env.insert(
            "TOOLGATE_REQUEST_ID".to_owned(),
            ctx.request_id.as_str().to_owned(),
        );
        if let Some(trace_id) = &ctx.trace_id {
            env.insert("TOOLGATE_TRACE_ID".to_owned(), trace_id.clone());
        }

        let execution = self
            .sandbox
            .run(SandboxRequest {
                command: spec.command.clone(),
                args: argv,
                cwd: self.workdir.clone(),
                env,
                limits: SandboxLimits {
                    max_runtime: ctx.timeout,
                    max_output_bytes: self.max_output_bytes,
                },
            })
            .await
            .map_err(|err| AdapterError::Backend(format!("{err:#}")))?;

        let code = result_code(&execution);
        debug!(script = %spec.name, code, "script finished");
        let output = json!({
            "script_name": spec.name,
            "exit_code": execution.exit_code,
            "stdout": execution.stdout,
            "stderr": execution.stderr,
            "duration_ms": execution.duration_ms,
            "timed_out": execution.timed_out,
            "truncated": execution.truncated,
        });
        Ok(AdapterResult::failure(code, output))
    }
}

fn result_code(execution: &SandboxExecution) -> i32 {
    if execution.timed_out {
        return TIMEOUT_EXIT_CODE;
    }
    execution.exit_code.unwrap_or(SIGNAL_EXIT_CODE)
}

#[async_trait]
impl ToolAdapter for ScriptRunnerAdapter {
    async fn run(
        &self,
        function: &str,
        args: &Value,
        ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError> {
        match function {
            "run_script" => self.run_script(args, ctx).await,
            other => Err(AdapterError::UnknownFunction(other.to_owned())),
        }
    }
}
