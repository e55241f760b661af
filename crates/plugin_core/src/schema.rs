//! Plugin configuration validation: `config_schema` compiled and checked
//! with `jsonschema`, plus a small default-fill pass layered on top, since
//! `jsonschema` validates a document but does not mutate it to fill in
//! `default` values.

use jsonschema::JSONSchema;
use serde_json::{Map, Value};

/// Fills `config` with any `default` values declared in `schema` for
/// properties `config` doesn't already set, then validates the result.
///
/// Returns the defaulted config on success.
pub fn apply_defaults_and_validate(schema: &Value, config: &Value) -> Result<Value, String> {
    let mut config = config.clone();
    fill_defaults(schema, &mut config);
    validate(schema, &config)?;
    Ok(config)
}

/// Compiles `schema` and validates `config` against it, without mutating
/// either. An absent or empty schema accepts anything, matching a plugin
/// that declares no `config_schema` at all.
pub fn validate(schema: &Value, config: &Value) -> Result<(), String> {
    if is_empty_schema(schema) {
        return Ok(());
    }

    let compiled =
        JSONSchema::compile(schema).map_err(|e| format!("invalid config schema: {e}"))?;
    compiled.validate(config).map_err(|errors| {
        errors
            .map(|e| {
                let path = e.instance_path.to_string();
                let path = path.trim_start_matches('/');
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    })
}

fn is_empty_schema(schema: &Value) -> bool {
    match schema {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn fill_defaults(schema: &Value, config: &mut Value) {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return;
    };
    if config.is_null() {
        *config = Value::Object(Map::new());
    }
    let Value::Object(config_map) = config else {
        return;
    };
    for (key, prop_schema) in properties {
        if config_map.contains_key(key) {
            continue;
        }
        if let Some(default) = prop_schema.get("default") {
            config_map.insert(key.clone(), default.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "preserve_newlines": {"type": "boolean", "default": true},
                "model": {"type": "string"}
            },
            "required": ["model"],
            "additionalProperties": false
        })
    }

    #[test]
    fn fills_defaults_and_validates() {
        let cfg = json!({"model": "base"});
        let merged = apply_defaults_and_validate(&schema(), &cfg).unwrap();
        assert_eq!(merged["preserve_newlines"], json!(true));
        assert_eq!(merged["model"], json!("base"));
    }

    #[test]
    fn rejects_wrong_type() {
        let cfg = json!({"model": "base", "preserve_newlines": "yes"});
        let err = apply_defaults_and_validate(&schema(), &cfg).unwrap_err();
        assert!(err.contains("preserve_newlines"));
    }

    #[test]
    fn rejects_missing_required() {
        let cfg = json!({});
        let err = apply_defaults_and_validate(&schema(), &cfg).unwrap_err();
        assert!(err.contains("model"));
    }

    #[test]
    fn rejects_unknown_field_when_closed() {
        let cfg = json!({"model": "base", "extra": 1});
        let err = apply_defaults_and_validate(&schema(), &cfg).unwrap_err();
        assert!(err.contains("extra"));
    }

    #[test]
    fn empty_schema_accepts_anything() {
        let merged = apply_defaults_and_validate(&Value::Null, &json!({"whatever": 1})).unwrap();
        assert_eq!(merged["whatever"], json!(1));
    }
}
