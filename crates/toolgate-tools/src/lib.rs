//! Tool registry and the built-in adapters.
//!
//! The registry owns tool definitions, their compiled JSON Schemas, and the
//! adapter bound to each tool id. Adapters enforce their own allow-lists and
//! honour `dry_run`; the invocation server never reaches an external system
//! except through one of them.

pub mod adapters;
pub mod catalog;
pub mod registry;
pub mod schema;

pub use adapters::{
    CheckReport, CheckState, ConfigPatcherAdapter, GitHubChecksBackend, MetricPoint,
    MetricSummary, MetricsBackend, MetricsQueryAdapter, PrStatusAdapter, PrometheusBackend,
    ScriptRunnerAdapter, ScriptSpec, SourceControlBackend, StaticMetricsBackend,
    StaticSourceControl, TimeWindow,
};
pub use catalog::{
    CONFIG_PATCHER, CoreAdapters, METRICS_QUERY, PR_STATUS, SCRIPT_RUNNER, core_tool_definitions,
};
pub use registry::{FunctionSchemas, RegistryError, ToolRegistry};
pub use schema::CompiledSchema;
