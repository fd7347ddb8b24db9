//! JSON-Schema subset validation for collection documents.
//!
//! Supported keywords: `type` (a string or an array of strings, `"null"`
//! included), `properties`, `required`, `additionalProperties` (boolean),
//! `enum`, and `items` for arrays, nested to any depth. Unknown keywords
//! are ignored so schemas written for a full validator still load; the
//! reference annotation `x-bundoc-ref` is parsed separately by the
//! reference registry.

use serde_json::{Map, Value};

use crate::error::{DbError, Result};

/// A parsed collection schema.
#[derive(Debug, Clone)]
pub struct Schema {
    raw: Value,
}

impl Schema {
    /// Parses a schema, requiring a JSON object at the top level.
    pub fn parse(raw: Value) -> Result<Self> {
        if !raw.is_object() {
            return Err(DbError::InvalidArgument(
                "schema must be a JSON object".into(),
            ));
        }
        Ok(Self { raw })
    }

    /// The schema as provided, for the catalog and API responses.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Property subschemas of the top-level object schema, if declared.
    pub fn properties(&self) -> Option<&Map<String, Value>> {
        self.raw.get("properties").and_then(Value::as_object)
    }

    /// Validates a document against the schema.
    pub fn validate(&self, doc: &Value) -> Result<()> {
        validate_node(&self.raw, doc, "$")
    }

    /// Whether `field` may hold JSON `null` under this schema. True when
    /// the field is unconstrained; needed before a `set_null` delete policy
    /// writes the null.
    pub fn allows_null(&self, field: &str) -> bool {
        let Some(props) = self.properties() else {
            return true;
        };
        let Some(subschema) = props.get(field) else {
            // Unknown property: only additionalProperties=false forbids it,
            // and then the write would already have failed validation.
            return true;
        };
        match subschema.get("type") {
            None => true,
            Some(Value::String(ty)) => ty == "null",
            Some(Value::Array(types)) => types.iter().any(|ty| ty.as_str() == Some("null")),
            Some(_) => false,
        }
    }
}

fn validate_node(schema: &Value, value: &Value, path: &str) -> Result<()> {
    let Some(schema) = schema.as_object() else {
        // Non-object subschema: treat as unconstrained.
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        check_type(expected, value, path)?;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(DbError::SchemaViolation(format!(
                "{path}: value not in enum"
            )));
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    return Err(DbError::SchemaViolation(format!(
                        "{path}: missing required property {name:?}"
                    )));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        let additional = schema
            .get("additionalProperties")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        for (key, field_value) in object {
            match properties.and_then(|props| props.get(key)) {
                Some(subschema) => {
                    validate_node(subschema, field_value, &format!("{path}.{key}"))?
                }
                None => {
                    if !additional && key != crate::model::ID_FIELD {
                        return Err(DbError::SchemaViolation(format!(
                            "{path}: additional property {key:?} is not allowed"
                        )));
                    }
                }
            }
        }
    }

    if let Some(array) = value.as_array() {
        if let Some(items) = schema.get("items") {
            for (idx, item) in array.iter().enumerate() {
                validate_node(items, item, &format!("{path}[{idx}]"))?;
            }
        }
    }

    Ok(())
}

fn check_type(expected: &Value, value: &Value, path: &str) -> Result<()> {
    let matches = match expected {
        Value::String(ty) => type_matches(ty, value),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|ty| type_matches(ty, value)),
        _ => true,
    };
    if matches {
        Ok(())
    } else {
        Err(DbError::SchemaViolation(format!(
            "{path}: expected type {expected}, got {}",
            actual_type(value)
        )))
    }
}

fn type_matches(ty: &str, value: &Value) -> bool {
    match ty {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => false,
    }
}

fn actual_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users_schema() -> Schema {
        Schema::parse(json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"},
                "email": {"type": ["string", "null"]},
                "tags": {"type": "array", "items": {"type": "string"}},
                "address": {
                    "type": "object",
                    "properties": {"city": {"type": "string"}}
                }
            }
        }))
        .expect("parse")
    }

    #[test]
    fn accepts_conforming_documents() {
        let schema = users_schema();
        schema
            .validate(&json!({
                "_id": "u1",
                "name": "Alice",
                "age": 30,
                "email": null,
                "tags": ["a", "b"],
                "address": {"city": "Oslo"}
            }))
            .expect("valid");
    }

    #[test]
    fn rejects_wrong_types() {
        let schema = users_schema();
        assert!(schema.validate(&json!({"name": 7})).is_err());
        assert!(schema.validate(&json!({"name": "A", "age": "old"})).is_err());
        assert!(schema
            .validate(&json!({"name": "A", "tags": ["x", 1]}))
            .is_err());
    }

    #[test]
    fn rejects_missing_required() {
        let schema = users_schema();
        match schema.validate(&json!({"age": 3})) {
            Err(DbError::SchemaViolation(message)) => {
                assert!(message.contains("name"), "unexpected: {message}")
            }
            other => panic!("expected schema violation, got {other:?}"),
        }
    }

    #[test]
    fn additional_properties_false_rejects_unknowns() {
        let schema = Schema::parse(json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": false
        }))
        .expect("parse");
        schema.validate(&json!({"_id": "x", "a": "ok"})).expect("valid");
        assert!(schema.validate(&json!({"a": "ok", "b": 1})).is_err());
    }

    #[test]
    fn null_allowance_follows_type_unions() {
        let schema = users_schema();
        assert!(schema.allows_null("email"));
        assert!(!schema.allows_null("name"));
        assert!(schema.allows_null("unconstrained"));
    }

    #[test]
    fn enum_constrains_values() {
        let schema = Schema::parse(json!({
            "properties": {"state": {"enum": ["on", "off"]}}
        }))
        .expect("parse");
        schema.validate(&json!({"state": "on"})).expect("valid");
        assert!(schema.validate(&json!({"state": "maybe"})).is_err());
    }
}
