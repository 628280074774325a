pub mod config_patcher;
pub mod metrics;
pub mod script_runner;
pub mod source_control;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use toolgate_protocol::{AdapterError, AdapterResult};

pub use config_patcher::ConfigPatcherAdapter;
pub use metrics::{
    MetricPoint, MetricSummary, MetricsBackend, MetricsQueryAdapter, PrometheusBackend,
    StaticMetricsBackend, TimeWindow,
};
pub use script_runner::{ScriptRunnerAdapter, ScriptSpec};
pub use source_control::{
    CheckReport, CheckState, GitHubChecksBackend, PrStatusAdapter, SourceControlBackend,
    StaticSourceControl,
};

/// Deserialize already schema-checked arguments into the function's typed form.
pub(crate) fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T, AdapterError> {
    serde_json::from_value(args.clone()).map_err(|err| AdapterError::InvalidArgs(err.to_string()))
}

/// Uniform dry-run result: code 0, `dry_run: true`, a "Would ..." message and
/// any extra fields describing the planned action.
pub(crate) fn dry_run_result(message: String, extra: Map<String, Value>) -> AdapterResult {
    let mut output = Map::new();
    output.insert("dry_run".to_owned(), Value::Bool(true));
    output.insert("message".to_owned(), Value::String(message));
    output.extend(extra);
    AdapterResult::success(Value::Object(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Args {
        name: String,
    }

    #[test]
    fn parse_args_reports_invalid_arguments() {
        let parsed: Args = parse_args(&json!({"name": "x"})).unwrap();
        assert_eq!(parsed.name, "x");

        let error = parse_args::<Args>(&json!({"name": 1})).unwrap_err();
        assert_eq!(error.kind(), "invalid_args");
    }

    #[test]
    fn dry_run_result_shape() {
        let mut extra = Map::new();
        extra.insert("target".to_owned(), json!("a.json"));
        let result = dry_run_result("Would patch a.json".to_owned(), extra);

        assert!(result.is_success());
        assert_eq!(result.output["dry_run"], true);
        assert_eq!(result.output["target"], "a.json");
        assert!(result.output["message"].as_str().unwrap().starts_with("Would"));
    }
}
