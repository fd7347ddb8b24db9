//! Reference rules derived from `x-bundoc-ref` schema annotations.
//!
//! A property schema may carry
//! `"x-bundoc-ref": {"collection": "users", "field": "_id", "on_delete": "cascade"}`.
//! `field` defaults to `_id` and is the only supported target; `on_delete`
//! defaults to `set_null`. Rules are kept in two in-memory indexes —
//! outbound by source collection (checked on writes) and inbound by target
//! collection (checked on deletes) — both rebuilt from the catalog at open
//! and whenever a schema changes.

use std::collections::HashMap;

use serde_json::Value;

use crate::db::schema::Schema;
use crate::error::{DbError, Result};

/// Annotation key on property schemas.
pub const REF_KEY: &str = "x-bundoc-ref";

/// What a delete of the referenced target does to the referencing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    /// Refuse the delete while references exist.
    Restrict,
    /// Null out the referencing field.
    SetNull,
    /// Delete referencing documents transitively.
    Cascade,
}

impl OnDelete {
    fn parse(raw: &str) -> Result<Self> {
        Ok(match raw {
            "restrict" => OnDelete::Restrict,
            "set_null" => OnDelete::SetNull,
            "cascade" => OnDelete::Cascade,
            other => {
                return Err(DbError::InvalidReferenceSchema(format!(
                    "unsupported on_delete {other:?}"
                )))
            }
        })
    }
}

/// One field-level reference constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRule {
    /// Collection whose documents carry the reference.
    pub source_collection: String,
    /// Field holding the referenced id.
    pub source_field: String,
    /// Collection being referenced.
    pub target_collection: String,
    /// Delete policy.
    pub on_delete: OnDelete,
}

/// Outbound/inbound rule indexes for one database.
#[derive(Debug, Default)]
pub struct RefRegistry {
    outbound: HashMap<String, Vec<RefRule>>,
    inbound: HashMap<String, Vec<RefRule>>,
}

impl RefRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all rules sourced from `collection` with `rules`.
    pub fn set_collection_rules(&mut self, collection: &str, rules: Vec<RefRule>) {
        self.remove_collection(collection);
        for rule in rules {
            self.inbound
                .entry(rule.target_collection.clone())
                .or_default()
                .push(rule.clone());
            self.outbound
                .entry(rule.source_collection.clone())
                .or_default()
                .push(rule);
        }
    }

    /// Drops every rule sourced from `collection` (target-side entries
    /// pointing at it stay: they belong to other collections' schemas).
    pub fn remove_collection(&mut self, collection: &str) {
        self.outbound.remove(collection);
        for rules in self.inbound.values_mut() {
            rules.retain(|rule| rule.source_collection != collection);
        }
        self.inbound.retain(|_, rules| !rules.is_empty());
    }

    /// Rules whose source is `collection`; checked before writes.
    pub fn outbound(&self, collection: &str) -> &[RefRule] {
        self.outbound
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Rules targeting `collection`; drive delete policies.
    pub fn inbound(&self, collection: &str) -> &[RefRule] {
        self.inbound
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Extracts reference rules from a collection schema.
pub fn parse_rules(source_collection: &str, schema: &Schema) -> Result<Vec<RefRule>> {
    let mut rules = Vec::new();
    let Some(properties) = schema.properties() else {
        return Ok(rules);
    };

    for (field, subschema) in properties {
        let Some(annotation) = subschema.get(REF_KEY) else {
            continue;
        };
        let spec = annotation.as_object().ok_or_else(|| {
            DbError::InvalidReferenceSchema(format!(
                "{REF_KEY} on {field:?} must be an object"
            ))
        })?;

        let target_collection = spec
            .get("collection")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                DbError::InvalidReferenceSchema(format!(
                    "{REF_KEY} on {field:?} is missing \"collection\""
                ))
            })?;

        if let Some(target_field) = spec.get("field") {
            if target_field.as_str() != Some(crate::model::ID_FIELD) {
                return Err(DbError::InvalidReferenceSchema(format!(
                    "{REF_KEY} on {field:?}: only \"_id\" targets are supported"
                )));
            }
        }

        let on_delete = match spec.get("on_delete") {
            None => OnDelete::SetNull,
            Some(Value::String(raw)) => OnDelete::parse(raw)?,
            Some(_) => {
                return Err(DbError::InvalidReferenceSchema(format!(
                    "{REF_KEY} on {field:?}: on_delete must be a string"
                )))
            }
        };

        rules.push(RefRule {
            source_collection: source_collection.to_string(),
            source_field: field.clone(),
            target_collection: target_collection.to_string(),
            on_delete,
        });
    }
    Ok(rules)
}
