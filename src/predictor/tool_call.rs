//! Function (tool) calls requested by models.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A tool call the model asked for. `arguments` is the raw JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A function the model may call, as declared by a prompt version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: Value,
}

/// Provider-independent textual form of a tool call:
/// `{"function":{"name":...,"arguments":...}}`.
pub fn canonical_text(call: &FunctionCall) -> String {
    let arguments = serde_json::from_str::<Value>(&call.arguments)
        .unwrap_or_else(|_| Value::String(call.arguments.clone()));
    json!({ "function": { "name": call.name, "arguments": arguments } }).to_string()
}

/// Checks that every function declares an object schema for its parameters.
pub fn validate_functions(functions: &[FunctionSpec]) -> Result<(), String> {
    for f in functions {
        let is_object_schema = f
            .parameters
            .as_object()
            .and_then(|schema| schema.get("type"))
            .and_then(Value::as_str)
            == Some("object");
        if f.name.trim().is_empty() || !is_object_schema {
            return Err(format!("Invalid function schema for '{}'", f.name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_text_embeds_json_arguments() {
        let call = FunctionCall {
            id: "call_1".into(),
            name: "lookup".into(),
            arguments: r#"{"city":"Paris"}"#.into(),
        };
        let parsed: Value = serde_json::from_str(&canonical_text(&call)).unwrap();
        assert_eq!(parsed, json!({"function": {"name": "lookup", "arguments": {"city": "Paris"}}}));
    }

    #[test]
    fn canonical_text_keeps_unparseable_arguments_as_string() {
        let call = FunctionCall {
            id: "1".into(),
            name: "f".into(),
            arguments: "{\"partial".into(),
        };
        let parsed: Value = serde_json::from_str(&canonical_text(&call)).unwrap();
        assert_eq!(parsed["function"]["arguments"], "{\"partial");
    }

    #[test]
    fn rejects_non_object_schemas() {
        let good = FunctionSpec {
            name: "f".into(),
            description: String::new(),
            parameters: json!({"type": "object", "properties": {}}),
        };
        let bad = FunctionSpec {
            name: "g".into(),
            description: String::new(),
            parameters: json!(["not", "a", "schema"]),
        };
        assert!(validate_functions(&[good.clone()]).is_ok());
        assert_eq!(
            validate_functions(&[good, bad]).unwrap_err(),
            "Invalid function schema for 'g'"
        );
    }
}
