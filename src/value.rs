//! Argument and cell values exchanged with the host.
//!
//! JSON scalars map directly. Values JSON cannot represent natively travel as
//! single-key tagged objects: `{"@blob": [..]}`, `{"@bigint": ".."}` and
//! `{"@date": millis}`.

use crate::error::{BridgeError, Result};
use rusqlite::types::ValueRef;
use serde_json::{json, Map, Number, Value as JsonValue};
use std::collections::BTreeMap;

pub const BLOB_TAG: &str = "@blob";
pub const BIGINT_TAG: &str = "@bigint";
pub const DATE_TAG: &str = "@date";

/// A value as supplied by the host or read back from a result row.
///
/// `List` and `Map` exist so composite inputs can be represented and rejected
/// explicitly; they never bind.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
    /// Integer wider than 64 bits.
    BigInt(i128),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Boolean(_) => "boolean",
            Value::BigInt(_) => "bigint",
            Value::Date(_) => "date",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Decode a host JSON value. Only malformed tagged objects fail here;
    /// unsupported composites decode and are rejected by the sanitizer.
    pub fn from_json(json: &JsonValue) -> Result<Value> {
        Ok(match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Boolean(*b),
            JsonValue::Number(n) => number_to_value(n)?,
            JsonValue::String(s) => Value::Text(s.clone()),
            JsonValue::Array(items) => Value::List(
                items
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            JsonValue::Object(map) => object_to_value(map)?,
        })
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Integer(i) => json!(i),
            Value::Real(f) => Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(s) => json!(s),
            Value::Blob(bytes) => json!({ BLOB_TAG: bytes }),
            Value::Boolean(b) => json!(b),
            Value::BigInt(i) => json!({ BIGINT_TAG: i.to_string() }),
            Value::Date(millis) => json!({ DATE_TAG: millis }),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn number_to_value(n: &Number) -> Result<Value> {
    if let Some(i) = n.as_i64() {
        Ok(Value::Integer(i))
    } else if let Some(u) = n.as_u64() {
        Ok(Value::BigInt(u as i128))
    } else if let Some(f) = n.as_f64() {
        Ok(Value::Real(f))
    } else {
        Err(BridgeError::bad_param(format!("unrepresentable number {n}")))
    }
}

fn object_to_value(map: &Map<String, JsonValue>) -> Result<Value> {
    if map.len() == 1 {
        if let Some(bytes) = map.get(BLOB_TAG) {
            return decode_blob(bytes).map(Value::Blob);
        }
        if let Some(digits) = map.get(BIGINT_TAG) {
            return digits
                .as_str()
                .and_then(|s| s.trim().parse::<i128>().ok())
                .map(Value::BigInt)
                .ok_or_else(|| BridgeError::bad_param(format!("invalid {BIGINT_TAG} value {digits}")));
        }
        if let Some(millis) = map.get(DATE_TAG) {
            return millis
                .as_i64()
                .map(Value::Date)
                .ok_or_else(|| BridgeError::bad_param(format!("invalid {DATE_TAG} value {millis}")));
        }
    }
    let mut entries = BTreeMap::new();
    for (key, value) in map {
        entries.insert(key.clone(), Value::from_json(value)?);
    }
    Ok(Value::Map(entries))
}

fn decode_blob(json: &JsonValue) -> Result<Vec<u8>> {
    let items = json
        .as_array()
        .ok_or_else(|| BridgeError::bad_param(format!("{BLOB_TAG} expects a byte array")))?;
    items
        .iter()
        .map(|b| {
            b.as_u64()
                .and_then(|b| u8::try_from(b).ok())
                .ok_or_else(|| BridgeError::bad_param(format!("{BLOB_TAG} element {b} is not a byte")))
        })
        .collect()
}

impl From<ValueRef<'_>> for Value {
    fn from(cell: ValueRef<'_>) -> Self {
        match cell {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        }
    }
}

impl From<rusqlite::types::Value> for Value {
    fn from(value: rusqlite::types::Value) -> Self {
        match value {
            rusqlite::types::Value::Null => Value::Null,
            rusqlite::types::Value::Integer(i) => Value::Integer(i),
            rusqlite::types::Value::Real(f) => Value::Real(f),
            rusqlite::types::Value::Text(s) => Value::Text(s),
            rusqlite::types::Value::Blob(b) => Value::Blob(b),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Blob(bytes)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}
