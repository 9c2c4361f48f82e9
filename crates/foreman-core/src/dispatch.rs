use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Trait for tools callable by the agent loop. Concrete implementations
/// live outside the core; the embedder registers them.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;
    async fn execute(&self, params: serde_json::Value) -> Result<String>;
}

/// Tool metadata handed to the context builder and the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Structured dispatch failures. Distinguishable from a truncated but
/// successful reply; the loop feeds these back to the model as text.
#[derive(Debug, thiserror::Error)]
pub enum DispatchFailure {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArgs { tool: String, reason: String },
    #[error("tool '{tool}' failed: {reason}")]
    Failed { tool: String, reason: String },
    #[error("tool '{tool}' timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },
}

/// Successful tool output, size-bounded with the truncation flagged.
#[derive(Debug, Clone)]
pub struct ToolReply {
    pub content: String,
    pub truncated: bool,
}

/// Interface the orchestrator consumes. Every call is bounded in time and
/// output size.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    fn schemas(&self) -> Vec<ToolSchema>;
    async fn invoke(
        &self,
        name: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolReply, DispatchFailure>;
}

/// Registry-backed dispatcher: validates arguments against each tool's
/// JSON schema, enforces the timeout, and bounds output size.
pub struct RegistryDispatcher {
    tools: HashMap<String, Box<dyn Tool>>,
    max_output_bytes: usize,
}

impl RegistryDispatcher {
    pub fn new(max_output_bytes: usize) -> Self {
        Self {
            tools: HashMap::new(),
            max_output_bytes,
        }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }
}

#[async_trait]
impl ToolDispatcher for RegistryDispatcher {
    fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    async fn invoke(
        &self,
        name: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolReply, DispatchFailure> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| DispatchFailure::UnknownTool(name.to_string()))?;

        let errors = validate_params(&args, &tool.parameters_schema());
        if !errors.is_empty() {
            return Err(DispatchFailure::InvalidArgs {
                tool: name.to_string(),
                reason: errors.join("; "),
            });
        }

        let output = match tokio::time::timeout(timeout, tool.execute(args)).await {
            Err(_) => {
                return Err(DispatchFailure::Timeout {
                    tool: name.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
            Ok(Err(e)) => {
                return Err(DispatchFailure::Failed {
                    tool: name.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(output)) => output,
        };

        Ok(bound_output(output, self.max_output_bytes))
    }
}

/// Truncate to the byte limit at a UTF-8 char boundary, flagging truncation.
fn bound_output(output: String, max_bytes: usize) -> ToolReply {
    if output.len() <= max_bytes {
        return ToolReply {
            content: output,
            truncated: false,
        };
    }
    let end = floor_char_boundary(&output, max_bytes);
    ToolReply {
        content: output[..end].to_string(),
        truncated: true,
    }
}

/// Find the largest byte index <= `max` that is a UTF-8 char boundary.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Validate tool parameters against a JSON schema.
/// Returns a list of validation error strings (empty if valid).
fn validate_params(params: &serde_json::Value, schema: &serde_json::Value) -> Vec<String> {
    let mut errors = Vec::new();
    validate_value(params, schema, "", &mut errors);
    errors
}

fn validate_value(
    val: &serde_json::Value,
    schema: &serde_json::Value,
    path: &str,
    errors: &mut Vec<String>,
) {
    let display_path = if path.is_empty() { "root" } else { path };

    if let Some(expected_type) = schema.get("type").and_then(|t| t.as_str()) {
        let type_ok = match expected_type {
            "object" => val.is_object(),
            "array" => val.is_array(),
            "string" => val.is_string(),
            "integer" => val.is_i64() || val.is_u64(),
            "number" => val.is_number(),
            "boolean" => val.is_boolean(),
            "null" => val.is_null(),
            _ => true,
        };
        if !type_ok {
            errors.push(format!("{display_path}: expected type '{expected_type}'"));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(val) {
            errors.push(format!("{display_path}: value not in allowed enum"));
        }
    }

    if let Some(n) = val.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(|m| m.as_f64()) {
            if n < min {
                errors.push(format!("{display_path}: value {n} < minimum {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(|m| m.as_f64()) {
            if n > max {
                errors.push(format!("{display_path}: value {n} > maximum {max}"));
            }
        }
    }

    if let Some(obj) = val.as_object() {
        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for req in required.iter().filter_map(|r| r.as_str()) {
                if !obj.contains_key(req) {
                    let field_path = if path.is_empty() {
                        req.to_string()
                    } else {
                        format!("{path}.{req}")
                    };
                    errors.push(format!("{field_path}: required field missing"));
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (key, prop_schema) in props {
                if let Some(prop_val) = obj.get(key) {
                    let prop_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    validate_value(prop_val, prop_schema, &prop_path, errors);
                }
            }
        }
    }

    if let Some(arr) = val.as_array() {
        if let Some(items_schema) = schema.get("items") {
            for (i, item) in arr.iter().enumerate() {
                let item_path = format!("{display_path}[{i}]");
                validate_value(item, items_schema, &item_path, errors);
            }
        }
    }
}
