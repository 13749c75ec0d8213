//! Turns a backend's tool schemas into LLM tool definitions and checks the
//! arguments the model sends back.

use crate::api::{ChatToolDefinition, ChatToolFunction};
use crate::mcp::ToolSchema;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;

const GEMINI_UNSUPPORTED_KEYS: [&str; 3] = ["$defs", "$ref", "default"];

pub fn is_gemini_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("gemini")
}

/// Schemas without a top-level `type` are treated as a bare property map.
pub fn normalize_parameters(schema: &Value) -> Value {
    match schema {
        Value::Object(map) if map.contains_key("type") => schema.clone(),
        Value::Object(map) if map.is_empty() => json!({"type": "object", "properties": {}}),
        Value::Object(_) => json!({
            "type": "object",
            "properties": schema,
            "required": [],
        }),
        _ => json!({"type": "object", "properties": {}}),
    }
}

/// Recursively drops keys Gemini's function declarations reject.
pub fn simplify_for_gemini(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !GEMINI_UNSUPPORTED_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), simplify_for_gemini(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(simplify_for_gemini).collect()),
        other => other.clone(),
    }
}

pub fn tool_definition(tool: &ToolSchema, model: &str) -> ChatToolDefinition {
    let mut parameters = normalize_parameters(&tool.parameters);
    if is_gemini_model(model) {
        parameters = simplify_for_gemini(&parameters);
    }
    ChatToolDefinition {
        kind: "function".to_string(),
        function: ChatToolFunction {
            name: tool.name.clone(),
            description: Some(tool.description.clone()).filter(|text| !text.is_empty()),
            parameters,
        },
    }
}

/// Tool definitions for the active backend plus compiled argument validators.
pub struct ToolCatalog {
    definitions: Vec<ChatToolDefinition>,
    validators: HashMap<String, jsonschema::Validator>,
}

impl ToolCatalog {
    pub fn new(tools: &[ToolSchema], model: &str) -> Self {
        let definitions = tools.iter().map(|tool| tool_definition(tool, model)).collect();
        let validators = tools
            .iter()
            .filter_map(|tool| {
                let schema = normalize_parameters(&tool.parameters);
                match jsonschema::validator_for(&schema) {
                    Ok(validator) => Some((tool.name.clone(), validator)),
                    Err(err) => {
                        debug!(tool = %tool.name, error = %err, "Tool schema not validatable");
                        None
                    }
                }
            })
            .collect();
        Self {
            definitions,
            validators,
        }
    }

    pub fn definitions(&self) -> &[ChatToolDefinition] {
        &self.definitions
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Parses raw model arguments into an object and validates them against
    /// the tool's schema when one compiled. The error text is meant for the
    /// model.
    pub fn prepare_arguments(&self, tool: &str, raw: &str) -> Result<Map<String, Value>, String> {
        let arguments = parse_arguments(raw)?;
        if let Some(validator) = self.validators.get(tool) {
            let instance = Value::Object(arguments.clone());
            let problems: Vec<String> = validator
                .iter_errors(&instance)
                .map(|error| error.to_string())
                .collect();
            if !problems.is_empty() {
                return Err(format!(
                    "Invalid arguments for tool '{tool}': {}",
                    problems.join("; ")
                ));
            }
        }
        Ok(arguments)
    }
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(format!(
            "Tool arguments must be a JSON object, got: {other}"
        )),
        Err(err) => Err(format!("Tool arguments are not valid JSON: {err}")),
    }
}
