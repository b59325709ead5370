//! Structural validation of skill inputs against the manifest's
//! JSON-schema value: required keys, primitive types, nested objects and
//! array items. Intentionally a subset — manifests are first-party.

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
#[error("invalid inputs at {path}: {reason}")]
pub struct InputValidationError {
    pub path: String,
    pub reason: String,
}

fn error(path: &str, reason: impl Into<String>) -> InputValidationError {
    InputValidationError {
        path: path.to_string(),
        reason: reason.into(),
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn check_type(schema: &Value, value: &Value, path: &str) -> Result<(), InputValidationError> {
    match schema.get("type") {
        Some(Value::String(expected)) => {
            if !type_matches(expected, value) {
                return Err(error(path, format!("expected {expected}")));
            }
        }
        Some(Value::Array(options)) => {
            let ok = options
                .iter()
                .filter_map(|t| t.as_str())
                .any(|expected| type_matches(expected, value));
            if !ok {
                return Err(error(path, "value matches none of the allowed types"));
            }
        }
        _ => {}
    }
    Ok(())
}

fn validate_node(schema: &Value, value: &Value, path: &str) -> Result<(), InputValidationError> {
    check_type(schema, value, path)?;

    if let Some(allowed) = schema.get("enum").and_then(|v| v.as_array()) {
        if !allowed.contains(value) {
            return Err(error(path, "value is not in enum"));
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
            for key in required.iter().filter_map(|v| v.as_str()) {
                if !object.contains_key(key) {
                    return Err(error(path, format!("missing required field '{key}'")));
                }
            }
        }
        if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
            for (key, child_schema) in properties {
                if let Some(child) = object.get(key) {
                    validate_node(child_schema, child, &format!("{path}.{key}"))?;
                }
            }
        }
    }

    if let (Some(items_schema), Some(items)) = (schema.get("items"), value.as_array()) {
        for (index, item) in items.iter().enumerate() {
            validate_node(items_schema, item, &format!("{path}[{index}]"))?;
        }
    }

    Ok(())
}

pub fn validate_inputs(schema: &Value, inputs: &Value) -> Result<(), InputValidationError> {
    validate_node(schema, inputs, "$")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "due_at": {"type": "string"},
                "text": {"type": "string"},
                "attempts": {"type": "integer"},
                "tags": {"type": "array", "items": {"type": "string"}},
            },
            "required": ["text"],
        })
    }

    #[test]
    fn valid_inputs_pass() {
        let inputs = json!({"text": "попить воды", "attempts": 2, "tags": ["дом"]});
        assert!(validate_inputs(&schema(), &inputs).is_ok());
    }

    #[test]
    fn missing_required_field_fails() {
        let err = validate_inputs(&schema(), &json!({"due_at": "сейчас"})).unwrap_err();
        assert!(err.reason.contains("text"));
    }

    #[test]
    fn wrong_types_fail_with_path() {
        let err = validate_inputs(&schema(), &json!({"text": 5})).unwrap_err();
        assert_eq!(err.path, "$.text");
        let err =
            validate_inputs(&schema(), &json!({"text": "ок", "tags": ["a", 1]})).unwrap_err();
        assert_eq!(err.path, "$.tags[1]");
    }
}
