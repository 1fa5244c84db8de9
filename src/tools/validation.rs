//! Validate tool call arguments against JSON Schema before execution.

use serde_json::Value;

/// Validate tool arguments against a JSON Schema.
///
/// Performs top-level validation: schema type check, required field presence,
/// property type and enum membership. Returns `Ok(())` when valid, otherwise
/// every violation found, one message per field.
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<(), Vec<String>> {
    let mut violations = Vec::new();

    if let Some(schema_type) = schema.get("type").and_then(|v| v.as_str()) {
        if schema_type == "object" && !args.is_object() {
            violations.push(format!(
                "expected object arguments, got {}",
                json_type_name(args)
            ));
            return Err(violations);
        }
    }

    let Some(obj) = args.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for name in required.iter().filter_map(|field| field.as_str()) {
            if !obj.contains_key(name) {
                violations.push(format!("missing required field '{name}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
        for (key, value) in obj {
            let Some(prop_schema) = properties.get(key) else {
                continue;
            };
            if let Some(expected_type) = prop_schema.get("type").and_then(|v| v.as_str()) {
                if !value_matches_type(value, expected_type) {
                    violations.push(format!(
                        "field '{}' expected type '{}', got {}",
                        key,
                        expected_type,
                        json_type_name(value)
                    ));
                    continue;
                }
            }
            if let Some(allowed) = prop_schema.get("enum").and_then(|v| v.as_array()) {
                if !allowed.contains(value) {
                    violations.push(format!(
                        "field '{key}' must be one of {}",
                        Value::Array(allowed.clone())
                    ));
                }
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Coerce string values of a textual (tag-extracted) call to the schema's
/// declared property types.
///
/// Tag attributes and parameter elements only carry text, so `"3"` for an
/// integer field or `"[\"a\"]"` for an array field is parsed as JSON. Values
/// that do not parse are left untouched for [`validate_arguments`] to report.
pub fn coerce_textual_arguments(args: Value, schema: &Value) -> Value {
    let Value::Object(mut obj) = args else {
        return args;
    };
    let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) else {
        return Value::Object(obj);
    };
    for (key, value) in obj.iter_mut() {
        let Some(expected) = properties
            .get(key)
            .and_then(|p| p.get("type"))
            .and_then(|t| t.as_str())
        else {
            continue;
        };
        if expected == "string" {
            continue;
        }
        if let Value::String(text) = value {
            if let Ok(parsed) = serde_json::from_str::<Value>(text.trim()) {
                if value_matches_type(&parsed, expected) {
                    *value = parsed;
                }
            }
        }
    }
    Value::Object(obj)
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
