//! Tool registry and dispatch.
//!
//! Tools are registered in a fixed order, which is the order `tools/list`
//! reports. An unknown tool name is a *tool-level* failure (an `isError`
//! result with `METHOD_NOT_FOUND`), not an RPC error, so agents can keep
//! the session alive and correct themselves.

pub mod audio_tools;
pub mod retrieval_tools;

use crate::mcp::types::{ToolError, ToolResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(rename = "outputSchema", skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// A handler may serve several tool names; dispatch passes the name back.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, name: &str, args: Map<String, Value>)
        -> Result<ToolResult, ToolError>;
}

pub struct ToolRegistry {
    tools: Vec<(ToolDefinition, Arc<dyn ToolHandler>)>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        debug_assert!(
            !self.tools.iter().any(|(d, _)| d.name == definition.name),
            "duplicate tool name {}",
            definition.name
        );
        self.tools.push((definition, handler));
    }

    /// Definitions in declaration order.
    pub fn definitions(&self) -> Vec<&ToolDefinition> {
        self.tools.iter().map(|(d, _)| d).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Dispatch one `tools/call`. Always yields a result; failures are
    /// carried inside it.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> ToolResult {
        let handler = match self.tools.iter().find(|(d, _)| d.name == name) {
            Some((_, handler)) => handler.clone(),
            None => return ToolError::method_not_found(name).into_result(),
        };

        let args = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return ToolError::invalid_field("arguments must be an object")
                    .into_result()
            }
        };

        let start = Instant::now();
        let outcome = handler.call(name, args).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) => {
                tracing::debug!(tool = name, elapsed_ms, "tool call completed");
                result
            }
            Err(err) => {
                tracing::debug!(tool = name, elapsed_ms, code = err.code, "tool call failed");
                err.into_result()
            }
        }
    }
}

/// Central argument validation helpers.
///
/// Every tool schema sets `additionalProperties:false`, so unknown keys
/// are rejected here; numeric coercion accepts JSON integers and integral
/// floats only.
pub mod args {
    use super::*;

    pub fn reject_unknown(args: &Map<String, Value>, allowed: &[&str]) -> Result<(), ToolError> {
        for key in args.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(ToolError::invalid_field(format!(
                    "unknown argument '{key}'"
                )));
            }
        }
        Ok(())
    }

    pub fn require_str<'a>(
        args: &'a Map<String, Value>,
        key: &str,
    ) -> Result<&'a str, ToolError> {
        match args.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
            Some(Value::String(_)) => Err(ToolError::invalid_field(format!(
                "'{key}' must not be empty"
            ))),
            Some(_) => Err(ToolError::invalid_field(format!("'{key}' must be a string"))),
            None => Err(ToolError::missing_field(format!("'{key}' is required"))),
        }
    }

    pub fn opt_str<'a>(
        args: &'a Map<String, Value>,
        key: &str,
    ) -> Result<Option<&'a str>, ToolError> {
        match args.get(key) {
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(ToolError::invalid_field(format!("'{key}' must be a string"))),
            None => Ok(None),
        }
    }

    /// Integer coercion: JSON integers pass, floats only when integral.
    pub fn opt_i64(args: &Map<String, Value>, key: &str) -> Result<Option<i64>, ToolError> {
        let value = match args.get(key) {
            Some(value) => value,
            None => return Ok(None),
        };
        let number = value.as_f64().ok_or_else(|| {
            ToolError::invalid_field(format!("'{key}' must be a number"))
        })?;
        if let Some(int) = value.as_i64() {
            return Ok(Some(int));
        }
        if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
            return Ok(Some(number as i64));
        }
        Err(ToolError::invalid_field(format!(
            "'{key}' must be an integer"
        )))
    }

    pub fn opt_i64_in(
        args: &Map<String, Value>,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Option<i64>, ToolError> {
        match opt_i64(args, key)? {
            Some(value) if (min..=max).contains(&value) => Ok(Some(value)),
            Some(value) => Err(ToolError::invalid_range(format!(
                "'{key}' {value} outside [{min},{max}]"
            ))),
            None => Ok(None),
        }
    }

    /// The `k` rule: absent or non-positive falls back to the default,
    /// above the cap is a range violation.
    pub fn k_or_default(
        args: &Map<String, Value>,
        default: usize,
        cap: i64,
    ) -> Result<usize, ToolError> {
        match opt_i64(args, "k")? {
            None => Ok(default),
            Some(value) if value <= 0 => Ok(default),
            Some(value) if value <= cap => Ok(value as usize),
            Some(value) => Err(ToolError::invalid_range(format!(
                "'k' {value} outside [1,{cap}]"
            ))),
        }
    }
}
