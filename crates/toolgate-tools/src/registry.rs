use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;
use toolgate_protocol::{FunctionDefinition, ToolAdapter, ToolDefinition};
use tracing::debug;

use crate::schema::CompiledSchema;

/// Catalog problems. All of these are startup configuration errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool id must not be empty")]
    EmptyToolId,
    #[error("tool {tool} declares function {function} more than once")]
    DuplicateFunction { tool: String, function: String },
    #[error("tool {tool} function {function} has an invalid {which} schema: {message}")]
    InvalidSchema {
        tool: String,
        function: String,
        which: &'static str,
        message: String,
    },
    #[error("tool {tool} function {function} must declare a non-zero timeout")]
    ZeroTimeout { tool: String, function: String },
    #[error("tool not registered: {0}")]
    UnknownTool(String),
    #[error("tool {0} has no adapter bound")]
    MissingAdapter(String),
}

/// Compiled input and output contracts of one function.
#[derive(Debug, Clone)]
pub struct FunctionSchemas {
    pub input: CompiledSchema,
    pub output: CompiledSchema,
}

impl FunctionSchemas {
    pub fn input_violations(&self, args: &Value) -> Vec<String> {
        self.input.violations(args)
    }

    pub fn output_violations(&self, output: &Value) -> Vec<String> {
        self.output.violations(output)
    }
}

struct RegisteredTool {
    definition: ToolDefinition,
    schemas: HashMap<String, FunctionSchemas>,
    adapter: Option<Arc<dyn ToolAdapter>>,
}

/// Read-only catalog of tools and the adapters that execute them.
///
/// Populated once at startup and shared behind an `Arc` afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Add or replace a tool by id. Schemas are compiled here, so a bad
    /// catalog fails at startup rather than on the first request. Replacing a
    /// tool keeps the adapter already bound to its id.
    pub fn register(&mut self, definition: ToolDefinition) -> Result<(), RegistryError> {
        if definition.id.trim().is_empty() {
            return Err(RegistryError::EmptyToolId);
        }

        let mut schemas = HashMap::new();
        for function in &definition.functions {
            if schemas.contains_key(&function.name) {
                return Err(RegistryError::DuplicateFunction {
                    tool: definition.id.clone(),
                    function: function.name.clone(),
                });
            }
            if function.timeout_ms == 0 {
                return Err(RegistryError::ZeroTimeout {
                    tool: definition.id.clone(),
                    function: function.name.clone(),
                });
            }
            schemas.insert(
                function.name.clone(),
                compile_function(&definition.id, function)?,
            );
        }

        let adapter = self
            .tools
            .get(&definition.id)
            .and_then(|existing| existing.adapter.clone());
        debug!(
            tool = %definition.id,
            functions = definition.functions.len(),
            "tool registered"
        );
        self.tools.insert(
            definition.id.clone(),
            RegisteredTool {
                definition,
                schemas,
                adapter,
            },
        );
        Ok(())
    }

    pub fn bind_adapter(
        &mut self,
        tool_id: &str,
        adapter: Arc<dyn ToolAdapter>,
    ) -> Result<(), RegistryError> {
        let tool = self
            .tools
            .get_mut(tool_id)
            .ok_or_else(|| RegistryError::UnknownTool(tool_id.to_owned()))?;
        tool.adapter = Some(adapter);
        Ok(())
    }

    pub fn register_with_adapter(
        &mut self,
        definition: ToolDefinition,
        adapter: Arc<dyn ToolAdapter>,
    ) -> Result<(), RegistryError> {
        let tool_id = definition.id.clone();
        self.register(definition)?;
        self.bind_adapter(&tool_id, adapter)
    }

    pub fn get_tool(&self, tool_id: &str) -> Option<&ToolDefinition> {
        self.tools.get(tool_id).map(|tool| &tool.definition)
    }

    pub fn get_adapter(&self, tool_id: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.tools
            .get(tool_id)
            .and_then(|tool| tool.adapter.clone())
    }

    pub fn function(&self, tool_id: &str, name: &str) -> Option<&FunctionDefinition> {
        self.get_tool(tool_id).and_then(|tool| tool.function(name))
    }

    pub fn schemas(&self, tool_id: &str, function: &str) -> Option<&FunctionSchemas> {
        self.tools
            .get(tool_id)
            .and_then(|tool| tool.schemas.get(function))
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values().map(|tool| &tool.definition)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Confirms every registered tool can actually be dispatched.
    pub fn validate(&self) -> Result<(), RegistryError> {
        match self.tools.values().find(|tool| tool.adapter.is_none()) {
            Some(tool) => Err(RegistryError::MissingAdapter(tool.definition.id.clone())),
            None => Ok(()),
        }
    }
}

fn compile_function(
    tool_id: &str,
    function: &FunctionDefinition,
) -> Result<FunctionSchemas, RegistryError> {
    let compile = |which: &'static str, document: &Value| {
        CompiledSchema::compile(document).map_err(|message| RegistryError::InvalidSchema {
            tool: tool_id.to_owned(),
            function: function.name.clone(),
            which,
            message,
        })
    };
    Ok(FunctionSchemas {
        input: compile("input", &function.input_schema)?,
        output: compile("output", &function.output_schema)?,
    })
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use toolgate_protocol::{
        AdapterContext, AdapterError, AdapterResult, Permission, Sensitivity,
    };

    struct EchoAdapter;

    #[async_trait]
    impl ToolAdapter for EchoAdapter {
        async fn run(
            &self,
            _function: &str,
            args: &Value,
            _ctx: &AdapterContext,
        ) -> Result<AdapterResult, AdapterError> {
            Ok(AdapterResult::success(args.clone()))
        }
    }

    fn function(name: &str) -> FunctionDefinition {
        FunctionDefinition {
            name: name.to_owned(),
            description: "test function".to_owned(),
            input_schema: json!({"type": "object"}),
            output_schema: json!({"type": "object"}),
            timeout_ms: 1_000,
            sensitivity: Sensitivity::Low,
        }
    }

    fn tool(id: &str, functions: Vec<FunctionDefinition>) -> ToolDefinition {
        ToolDefinition {
            id: id.to_owned(),
            name: id.to_owned(),
            description: "test tool".to_owned(),
            functions,
            required_permissions: vec![Permission::new("test:use")],
        }
    }

    #[test]
    fn register_and_resolve() {
        let mut registry = ToolRegistry::default();
        registry
            .register_with_adapter(tool("echo", vec![function("say")]), Arc::new(EchoAdapter))
            .unwrap();

        assert!(registry.get_tool("echo").is_some());
        assert!(registry.get_adapter("echo").is_some());
        assert!(registry.function("echo", "say").is_some());
        assert!(registry.function("echo", "shout").is_none());
        assert!(registry.schemas("echo", "say").is_some());
        assert!(registry.get_tool("missing").is_none());
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn last_registration_wins_and_keeps_adapter() {
        let mut registry = ToolRegistry::default();
        registry
            .register_with_adapter(tool("echo", vec![function("say")]), Arc::new(EchoAdapter))
            .unwrap();
        registry
            .register(tool("echo", vec![function("say"), function("whisper")]))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.function("echo", "whisper").is_some());
        assert!(registry.get_adapter("echo").is_some());
    }

    #[test]
    fn duplicate_function_names_are_configuration_errors() {
        let mut registry = ToolRegistry::default();
        let error = registry
            .register(tool("echo", vec![function("say"), function("say")]))
            .unwrap_err();
        assert!(matches!(error, RegistryError::DuplicateFunction { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn invalid_schema_and_zero_timeout_are_rejected() {
        let mut registry = ToolRegistry::default();
        let mut bad_schema = function("say");
        bad_schema.input_schema = json!({"type": 42});
        assert!(matches!(
            registry.register(tool("echo", vec![bad_schema])),
            Err(RegistryError::InvalidSchema { which: "input", .. })
        ));

        let mut no_timeout = function("say");
        no_timeout.timeout_ms = 0;
        assert!(matches!(
            registry.register(tool("echo", vec![no_timeout])),
            Err(RegistryError::ZeroTimeout { .. })
        ));
    }

    #[test]
    fn validate_requires_adapters() {
        let mut registry = ToolRegistry::default();
        registry.register(tool("orphan", vec![function("f")])).unwrap();
        assert!(matches!(
            registry.validate(),
            Err(RegistryError::MissingAdapter(id)) if id == "orphan"
        ));
        assert!(matches!(
            registry.bind_adapter("ghost", Arc::new(EchoAdapter)),
            Err(RegistryError::UnknownTool(_))
        ));
    }
}
