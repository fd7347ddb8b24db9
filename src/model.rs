//! Document model and identifier generation.
//!
//! A [`Document`] is an unordered map from string keys to JSON values with
//! exactly one reserved key, `_id`, holding a non-empty string identifier.
//! Documents are immutable once serialized; an update produces a new
//! version. Numbers keep their `serde_json::Number` provenance, so values
//! that arrived as integers round-trip as integers.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde_json::{Map, Value};

use crate::error::{DbError, Result};

/// Reserved key holding the document identifier.
pub const ID_FIELD: &str = "_id";

/// Longest accepted `_id`, in bytes. Ids index into the B+ tree, whose
/// node layout bounds key length.
pub const MAX_ID_LEN: usize = 512;

/// A JSON document owned by a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    fields: Map<String, Value>,
}

impl Document {
    /// Wraps a JSON value, verifying it is an object and that any `_id`
    /// present is a non-empty string.
    pub fn from_value(value: Value) -> Result<Self> {
        let fields = match value {
            Value::Object(map) => map,
            other => {
                return Err(DbError::InvalidDocument(format!(
                    "expected a JSON object, got {}",
                    json_type_name(&other)
                )))
            }
        };
        let doc = Self { fields };
        if let Some(id) = doc.fields.get(ID_FIELD) {
            validate_id_value(id)?;
        }
        Ok(doc)
    }

    /// Parses a document from raw JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| DbError::InvalidDocument(format!("malformed JSON: {err}")))?;
        Self::from_value(value)
    }

    /// Serializes the document to JSON bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&Value::Object(self.fields.clone()))
            .unwrap_or_else(|_| b"{}".to_vec())
    }

    /// Returns the document as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// The `_id`, if one has been assigned.
    pub fn id(&self) -> Option<&str> {
        self.fields.get(ID_FIELD).and_then(Value::as_str)
    }

    /// Assigns the `_id`, replacing any existing value.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.fields
            .insert(ID_FIELD.to_string(), Value::String(id.into()));
    }

    /// Ensures the document carries a valid `_id`, generating one when
    /// absent, and returns it.
    pub fn ensure_id(&mut self) -> Result<String> {
        match self.fields.get(ID_FIELD) {
            Some(value) => {
                validate_id_value(value)?;
                Ok(value.as_str().unwrap_or_default().to_string())
            }
            None => {
                let id = generate_id();
                self.set_id(id.clone());
                Ok(id)
            }
        }
    }

    /// Read access to a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The underlying field map.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Shallow-merges `partial` into this document.
    ///
    /// Each top-level key in `partial` replaces the existing value wholesale.
    /// An explicit JSON `null` is stored as a null value, never treated as a
    /// field removal. `_id` cannot be changed by a patch.
    pub fn apply_patch(&mut self, partial: &Map<String, Value>) -> Result<()> {
        for (key, value) in partial {
            if key == ID_FIELD {
                let existing = self.id().unwrap_or_default();
                if value.as_str() != Some(existing) {
                    return Err(DbError::InvalidDocument(
                        "patch may not change _id".into(),
                    ));
                }
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

fn validate_id_value(value: &Value) -> Result<()> {
    let id = value.as_str().ok_or_else(|| {
        DbError::InvalidDocument("_id must be a string".into())
    })?;
    if id.is_empty() {
        return Err(DbError::InvalidDocument("_id must be non-empty".into()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(DbError::InvalidDocument(format!(
            "_id exceeds {MAX_ID_LEN} bytes"
        )));
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generates a time-ordered 26-character identifier.
///
/// Layout follows ULID: 48 bits of unix milliseconds followed by 80 bits of
/// randomness, Crockford base32 encoded. Uniqueness is only required within
/// one collection, so no monotonicity tie-break is carried across calls.
pub fn generate_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
        & 0xFFFF_FFFF_FFFF;

    let mut entropy = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut entropy);

    let mut bytes = [0u8; 16];
    bytes[0..6].copy_from_slice(&millis.to_be_bytes()[2..8]);
    bytes[6..16].copy_from_slice(&entropy);

    // 128 bits -> 26 base32 characters, most significant first.
    let hi = u64::from_be_bytes(bytes[0..8].try_into().expect("slice is 8 bytes"));
    let lo = u64::from_be_bytes(bytes[8..16].try_into().expect("slice is 8 bytes"));
    let mut value = (hi as u128) << 64 | lo as u128;

    let mut out = [b'0'; 26];
    for slot in out.iter_mut().rev() {
        *slot = CROCKFORD[(value & 0x1F) as usize];
        value >>= 5;
    }
    String::from_utf8_lossy(&out).into_owned()
}
