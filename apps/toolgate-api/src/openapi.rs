use serde_json::{Value, json};

fn json_response(description: &str, schema: Value) -> Value {
    json!({
        "description": description,
        "content": {
            "application/json": { "schema": schema },
        },
    })
}

pub fn openapi_spec() -> Value {
    let response_ref = json!({ "$ref": "#/components/schemas/Response" });
    let api_error = json!({ "$ref": "#/components/schemas/ApiError" });
    let audit_read = json!([{ "capabilityToken": ["audit:read"] }]);
    json!({
        "openapi": "3.1.0",
        "info": {
            "title": "toolgate API",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Capability-gated tool invocation with a signed audit trail.",
        },
        "paths": {
            "/healthz": {
                "get": {
                    "summary": "Health check",
                    "responses": {
                        "200": json_response("Service health", json!({
                            "type": "object",
                            "required": ["status", "service"],
                            "properties": {
                                "status": { "type": "string" },
                                "service": { "type": "string" },
                            },
                        })),
                    },
                },
            },
            "/invoke": {
                "post": {
                    "summary": "Invoke one tool function",
                    "description": "Every parsed, non-replayed invocation is audited before the response is returned.",
                    "requestBody": {
                        "required": true,
                        "content": {
                            "application/json": {
                                "schema": { "$ref": "#/components/schemas/Invocation" },
                            },
                        },
                    },
                    "responses": {
                        "200": json_response("Invocation succeeded", response_ref.clone()),
                        "400": json_response("Malformed body, unknown tool or function, or schema violation", response_ref.clone()),
                        "403": json_response("Invalid token or missing permissions", response_ref.clone()),
                        "409": json_response("request_id already used", response_ref.clone()),
                        "500": json_response("Execution or internal failure", response_ref),
                    },
                },
            },
            "/tools": {
                "get": {
                    "summary": "List registered tools",
                    "responses": {
                        "200": json_response("Tool catalog", json!({
                            "type": "object",
                            "required": ["tools"],
                            "properties": {
                                "tools": {
                                    "type": "array",
                                    "items": { "$ref": "#/components/schemas/ToolDefinition" },
                                },
                            },
                        })),
                    },
                },
            },
            "/audit/{request_id}": {
                "get": {
                    "summary": "Fetch the audit record of one request",
                    "security": audit_read.clone(),
                    "parameters": [
                        {
                            "name": "request_id",
                            "in": "path",
                            "required": true,
                            "schema": { "type": "string" },
                        },
                    ],
                    "responses": {
                        "200": json_response("Audit record", json!({ "$ref": "#/components/schemas/AuditEvent" })),
                        "401": json_response("Missing or invalid bearer token", api_error.clone()),
                        "403": json_response("Token lacks audit:read", api_error.clone()),
                        "404": json_response("No record for this request", api_error.clone()),
                    },
                },
            },
            "/audit/stream": {
                "get": {
                    "summary": "Tail audit records as they are persisted",
                    "security": audit_read,
                    "parameters": [
                        { "name": "tool_id", "in": "query", "required": false, "schema": { "type": "string" } },
                        { "name": "caller_id", "in": "query", "required": false, "schema": { "type": "string" } },
                    ],
                    "responses": {
                        "200": {
                            "description": "Server-sent events named `audit.event`; `stream.lagged` reports dropped records",
                            "content": {
                                "text/event-stream": { "schema": { "type": "string" } },
                            },
                        },
                        "401": json_response("Missing or invalid bearer token", api_error.clone()),
                        "403": json_response("Token lacks audit:read", api_error),
                    },
                },
            },
            "/openapi.json": {
                "get": {
                    "summary": "This document",
                    "responses": {
                        "200": json_response("OpenAPI 3.1 document", json!({ "type": "object" })),
                    },
                },
            },
            "/docs": {
                "get": {
                    "summary": "Interactive API reference",
                    "responses": {
                        "200": {
                            "description": "HTML page",
                            "content": { "text/html": { "schema": { "type": "string" } } },
                        },
                    },
                },
            },
        },
        "components": {
            "securitySchemes": {
                "capabilityToken": {
                    "type": "http",
                    "scheme": "bearer",
                    "description": "Capability token minted by `toolgatectl token issue`",
                },
            },
            "schemas": {
                "Invocation": {
                    "type": "object",
                    "required": ["request_id", "caller_id", "capability_token", "tool_id", "function_name", "args"],
                    "properties": {
                        "request_id": { "type": "string" },
                        "caller_id": { "type": "string" },
                        "capability_token": { "type": "string" },
                        "tool_id": { "type": "string" },
                        "function_name": { "type": "string" },
                        "args": { "type": "object" },
                        "metadata": {
                            "type": "object",
                            "properties": {
                                "trace_id": { "type": "string" },
                                "pr_id": { "type": "string" },
                                "dry_run": { "type": "boolean", "default": false },
                            },
                        },
                    },
                },
                "Response": {
                    "type": "object",
                    "required": ["request_id", "status", "code", "signature"],
                    "properties": {
                        "request_id": { "type": "string" },
                        "status": { "type": "string", "enum": ["ok", "error"] },
                        "code": { "type": "integer" },
                        "output": {},
                        "error": { "$ref": "#/components/schemas/ErrorBody" },
                        "signature": { "type": "string", "description": "`<key_id>:<hex hmac>` over the response" },
                    },
                },
                "ErrorBody": {
                    "type": "object",
                    "required": ["kind", "message"],
                    "properties": {
                        "kind": { "$ref": "#/components/schemas/ErrorKind" },
                        "message": { "type": "string" },
                        "details": { "type": "object" },
                    },
                },
                "ErrorKind": {
                    "type": "string",
                    "enum": ["auth", "validation", "execution", "internal"],
                },
                "ToolDefinition": {
                    "type": "object",
                    "required": ["id", "name", "functions", "required_permissions"],
                    "properties": {
                        "id": { "type": "string" },
                        "name": { "type": "string" },
                        "description": { "type": "string" },
                        "functions": {
                            "type": "array",
                            "items": { "$ref": "#/components/schemas/FunctionDefinition" },
                        },
                        "required_permissions": {
                            "type": "array",
                            "items": { "type": "string" },
                        },
                    },
                },
                "FunctionDefinition": {
                    "type": "object",
                    "required": ["name", "input_schema", "output_schema", "timeout_ms"],
                    "properties": {
                        "name": { "type": "string" },
                        "description": { "type": "string" },
                        "input_schema": { "type": "object" },
                        "output_schema": { "type": "object" },
                        "timeout_ms": { "type": "integer", "minimum": 1 },
                        "sensitivity": { "type": "string", "enum": ["low", "medium", "high"] },
                    },
                },
                "AuditEvent": {
                    "type": "object",
                    "required": [
                        "event_id", "request_id", "caller_id", "tool_id", "function_name",
                        "args", "result_code", "dry_run", "timestamp", "key_id", "signature"
                    ],
                    "properties": {
                        "event_id": { "type": "string" },
                        "request_id": { "type": "string" },
                        "caller_id": { "type": "string" },
                        "tool_id": { "type": "string" },
                        "function_name": { "type": "string" },
                        "args": { "description": "Redacted according to the function's sensitivity" },
                        "result_code": { "type": "integer" },
                        "error_kind": { "$ref": "#/components/schemas/ErrorKind" },
                        "dry_run": { "type": "boolean" },
                        "trace_id": { "type": "string" },
                        "timestamp": { "type": "string", "format": "date-time" },
                        "key_id": { "type": "string" },
                        "signature": { "type": "string" },
                    },
                },
                "ApiError": {
                    "type": "object",
                    "required": ["error"],
                    "properties": { "error": { "type": "string" } },
                },
            },
        },
    })
}

pub fn scalar_docs_html(spec_url: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>toolgate API Docs</title>
    <style>
      html, body, #app {{
        margin: 0;
        padding: 0;
        height: 100%;
        width: 100%;
      }}
    </style>
  </head>
  <body>
    <div id="app"></div>
    <script src="https://cdn.jsdelivr.net/npm/@scalar/api-reference"></script>
    <script>
      Scalar.createApiReference('#app', {{
        url: '{spec_url}',
      }});
    </script>
  </body>
</html>
"#
    )
}
