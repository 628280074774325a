//! Tool catalog types and adapter results.

use std::time::Duration;

use crate::permission::Permission;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Audit sensitivity of a function; decides how arguments are redacted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    #[default]
    Low,
    Medium,
    High,
}

/// A named operation exposed by a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub timeout_ms: u64,
    #[serde(default)]
    pub sensitivity: Sensitivity,
}

impl FunctionDefinition {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A tool in the catalog. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub functions: Vec<FunctionDefinition>,
    pub required_permissions: Vec<Permission>,
}

impl ToolDefinition {
    pub fn function(&self, name: &str) -> Option<&FunctionDefinition> {
        self.functions.iter().find(|function| function.name == name)
    }
}

/// Outcome of one adapter execution. `code == 0` means success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterResult {
    pub code: i32,
    pub output: Value,
}

impl AdapterResult {
    pub fn success(output: Value) -> Self {
        Self { code: 0, output }
    }

    pub fn failure(code: i32, output: Value) -> Self {
        Self { code, output }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}
