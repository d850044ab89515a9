//! Tool utilities.
//!
//! Helpers for presenting tool descriptors and reading tool results.

use std::collections::HashMap;

use serde_json::Value;

use super::protocol::{CallToolResult, ToolContent, ToolDescriptor};

/// Format a tool for display.
pub fn format_tool(tool: &ToolDescriptor, server: Option<&str>) -> String {
    let mut output = String::new();

    if let Some(srv) = server {
        output.push_str(&format!("{} (from {})", tool.name, srv));
    } else {
        output.push_str(&tool.name);
    }

    if let Some(ref desc) = tool.description {
        output.push_str(&format!("\n  {}", desc));
    }

    if let Some(props) = tool.input_schema.get("properties").and_then(Value::as_object) {
        if !props.is_empty() {
            output.push_str("\n  Parameters:");
            for (name, schema) in props {
                let type_str = schema.get("type").and_then(|v| v.as_str()).unwrap_or("any");
                let desc = schema.get("description").and_then(|v| v.as_str()).unwrap_or("");
                output.push_str(&format!("\n    - {} ({}): {}", name, type_str, desc));
            }
        }
    }

    let required: Vec<&str> = tool
        .input_schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if !required.is_empty() {
        output.push_str(&format!("\n  Required: {}", required.join(", ")));
    }

    output
}

/// Extract text content from tool result.
pub fn extract_text_content(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| match c {
            ToolContent::Text { text } => Some(text.as_str()),
            ToolContent::Resource { text, .. } => text.as_deref(),
            ToolContent::Image { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a JSON object given on the command line into tool arguments.
pub fn parse_arguments(json: &str) -> Result<HashMap<String, Value>, String> {
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(other) => Err(format!("tool arguments must be a JSON object, got {}", other)),
        Err(e) => Err(format!("invalid JSON arguments: {}", e)),
    }
}
