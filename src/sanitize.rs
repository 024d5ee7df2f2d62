//! Conversion of host argument lists into SQLite-bindable values.

use crate::error::{BridgeError, Result};
use crate::value::Value;
use rusqlite::types::Value as SqlValue;

/// Normalize one host value for binding. Composites are rejected.
pub fn to_sql_value(index: usize, value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::BigInt(i) => match i64::try_from(*i) {
            Ok(small) => SqlValue::Integer(small),
            Err(_) => SqlValue::Text(i.to_string()),
        },
        Value::Date(millis) => SqlValue::Integer(*millis),
        Value::List(_) | Value::Map(_) => {
            return Err(BridgeError::bad_param(format!(
                "argument {index} of type {} is not bindable",
                value.type_name()
            )))
        }
    })
}

/// Sanitize an ordered argument list. An empty list yields an empty list.
pub fn sanitize(raw: &[Value]) -> Result<Vec<SqlValue>> {
    raw.iter()
        .enumerate()
        .map(|(index, value)| to_sql_value(index, value))
        .collect()
}

/// Like [`sanitize`], but keeps "no argument list" apart from "empty list".
pub fn sanitize_optional(raw: Option<&[Value]>) -> Result<Option<Vec<SqlValue>>> {
    raw.map(sanitize).transpose()
}
