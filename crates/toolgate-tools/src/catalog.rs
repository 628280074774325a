//! Built-in tool definitions.

use std::sync::Arc;

use serde_json::json;
use toolgate_protocol::{FunctionDefinition, Permission, Sensitivity, ToolAdapter, ToolDefinition};

use crate::registry::{RegistryError, ToolRegistry};

pub const SCRIPT_RUNNER: &str = "script-runner";
pub const CONFIG_PATCHER: &str = "config-patcher";
pub const METRICS_QUERY: &str = "metrics-query";
pub const PR_STATUS: &str = "pr-status";

/// Executors for the built-in catalog, one per tool.
#[derive(Clone)]
pub struct CoreAdapters {
    pub script_runner: Arc<dyn ToolAdapter>,
    pub config_patcher: Arc<dyn ToolAdapter>,
    pub metrics_query: Arc<dyn ToolAdapter>,
    pub pr_status: Arc<dyn ToolAdapter>,
}

impl ToolRegistry {
    pub fn with_core_tools(adapters: CoreAdapters) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        registry.register_with_adapter(script_runner_tool(), adapters.script_runner)?;
        registry.register_with_adapter(config_patcher_tool(), adapters.config_patcher)?;
        registry.register_with_adapter(metrics_query_tool(), adapters.metrics_query)?;
        registry.register_with_adapter(pr_status_tool(), adapters.pr_status)?;
        Ok(registry)
    }
}

pub fn core_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        script_runner_tool(),
        config_patcher_tool(),
        metrics_query_tool(),
        pr_status_tool(),
    ]
}

pub fn script_runner_tool() -> ToolDefinition {
    ToolDefinition {
        id: SCRIPT_RUNNER.to_owned(),
        name: "Script runner".to_owned(),
        description: "Runs allow-listed scripts with a bounded runtime".to_owned(),
        functions: vec![FunctionDefinition {
            name: "run_script".to_owned(),
            description: "Run a named script from the allow-list".to_owned(),
            input_schema: json!({
                "type": "object",
                "required": ["script_name"],
                "properties": {
                    "script_name": { "type": "string", "minLength": 1 },
                    "args": { "type": "array", "items": { "type": "string" } }
                },
                "additionalProperties": false
            }),
            output_schema: json!({
                "type": "object",
                "required": ["script_name", "exit_code", "stdout", "stderr", "duration_ms"],
                "properties": {
                    "script_name": { "type": "string" },
                    "exit_code": { "type": ["integer", "null"] },
                    "stdout": { "type": "string" },
                    "stderr": { "type": "string" },
                    "duration_ms": { "type": "integer", "minimum": 0 },
                    "timed_out": { "type": "boolean" },
                    "truncated": { "type": "boolean" }
                }
            }),
            timeout_ms: 120_000,
            sensitivity: Sensitivity::Medium,
        }],
        required_permissions: vec![Permission::new("scripts:run")],
    }
}

pub fn config_patcher_tool() -> ToolDefinition {
    let patch_output = json!({
        "type": "object",
        "required": ["change_id", "path", "keys_changed", "new_sha256"],
        "properties": {
            "change_id": { "type": "string", "pattern": "^chg-[0-9a-f]{32}$" },
            "path": { "type": "string" },
            "keys_changed": { "type": "array", "items": { "type": "string" } },
            "previous_sha256": { "type": ["string", "null"] },
            "new_sha256": { "type": "string" }
        }
    });

    ToolDefinition {
        id: CONFIG_PATCHER.to_owned(),
        name: "Config patcher".to_owned(),
        description: "Edits allow-listed JSON and TOML configuration files".to_owned(),
        functions: vec![
            FunctionDefinition {
                name: "set_key".to_owned(),
                description: "Set one (optionally dotted) key to a value".to_owned(),
                input_schema: json!({
                    "type": "object",
                    "required": ["path", "key", "value"],
                    "properties": {
                        "path": { "type": "string", "minLength": 1 },
                        "key": { "type": "string", "minLength": 1 },
                        "value": {}
                    },
                    "additionalProperties": false
                }),
                output_schema: patch_output.clone(),
                timeout_ms: 10_000,
                sensitivity: Sensitivity::High,
            },
            FunctionDefinition {
                name: "merge_patch".to_owned(),
                description: "Shallow-merge an object into the file's top level".to_owned(),
                input_schema: json!({
                    "type": "object",
                    "required": ["path", "patch"],
                    "properties": {
                        "path": { "type": "string", "minLength": 1 },
                        "patch": { "type": "object", "minProperties": 1 }
                    },
                    "additionalProperties": false
                }),
                output_schema: patch_output,
                timeout_ms: 10_000,
                sensitivity: Sensitivity::High,
            },
        ],
        required_permissions: vec![Permission::new("config:write")],
    }
}

pub fn metrics_query_tool() -> ToolDefinition {
    let stat = json!({ "type": ["number", "null"] });
    ToolDefinition {
        id: METRICS_QUERY.to_owned(),
        name: "Metrics query".to_owned(),
        description: "Reads allow-listed metric series and summarises them".to_owned(),
        functions: vec![FunctionDefinition {
            name: "query_metric".to_owned(),
            description: "Fetch a metric over a time window".to_owned(),
            input_schema: json!({
                "type": "object",
                "required": ["metric_name", "window"],
                "properties": {
                    "metric_name": {
                        "type": "string",
                        "pattern": "^[a-zA-Z_:][a-zA-Z0-9_:]*$"
                    },
                    "window": { "type": "string", "enum": ["5m", "1h", "24h"] }
                },
                "additionalProperties": false
            }),
            output_schema: json!({
                "type": "object",
                "required": ["metric_name", "window", "points", "summary"],
                "properties": {
                    "metric_name": { "type": "string" },
                    "window": { "type": "string" },
                    "points": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["timestamp", "value"],
                            "properties": {
                                "timestamp": { "type": "integer" },
                                "value": { "type": "number" }
                            }
                        }
                    },
                    "summary": {
                        "type": "object",
                        "required": ["count", "min", "max", "avg", "p50", "p95", "p99"],
                        "properties": {
                            "count": { "type": "integer", "minimum": 0 },
                            "min": stat,
                            "max": stat,
                            "avg": stat,
                            "p50": stat,
                            "p95": stat,
                            "p99": stat
                        }
                    }
                }
            }),
            timeout_ms: 15_000,
            sensitivity: Sensitivity::Low,
        }],
        required_permissions: vec![Permission::new("metrics:read")],
    }
}

pub fn pr_status_tool() -> ToolDefinition {
    ToolDefinition {
        id: PR_STATUS.to_owned(),
        name: "PR status".to_owned(),
        description: "Reports the state of a named check on a pull request".to_owned(),
        functions: vec![FunctionDefinition {
            name: "check_status".to_owned(),
            description: "Look up one check run on a pull request".to_owned(),
            input_schema: json!({
                "type": "object",
                "required": ["change_id", "check_name"],
                "properties": {
                    "change_id": { "type": "string", "pattern": "^[0-9]+$" },
                    "check_name": { "type": "string", "minLength": 1 }
                },
                "additionalProperties": false
            }),
            output_schema: json!({
                "type": "object",
                "required": ["change_id", "check_name", "status", "detail"],
                "properties": {
                    "change_id": { "type": "string" },
                    "check_name": { "type": "string" },
                    "status": {
                        "type": "string",
                        "enum": ["success", "failure", "pending", "not_found"]
                    },
                    "detail": { "type": "string" },
                    "url": { "type": ["string", "null"] }
                }
            }),
            timeout_ms: 15_000,
            sensitivity: Sensitivity::Low,
        }],
        required_permissions: vec![Permission::new("scm:read")],
    }
}
