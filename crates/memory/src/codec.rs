//! Conversions between [`PayloadValue`] and the typed-value representations
//! of the outside world (JSON from callers and models, qdrant's `Value`).
//!
//! Only the five payload shapes round-trip.  Anything else (null, nested
//! objects, arrays holding non-strings) is a [`MemoryError::Codec`], never a
//! silent drop.

use serde_json::Value as Json;

use crate::error::{MemoryError, Result};
use crate::schema::{Payload, PayloadValue};

/// Reject values the stores cannot persist and read back.  Non-finite floats
/// have no JSON form, so a stored NaN would fail to decode on every scan.
pub fn check_value(key: &str, value: &PayloadValue) -> Result<()> {
    match value {
        PayloadValue::Float(f) if !f.is_finite() => {
            Err(MemoryError::codec(key, format!("{f} is not a finite number")))
        }
        _ => Ok(()),
    }
}

pub fn check_payload(payload: &Payload) -> Result<()> {
    payload.iter().try_for_each(|(k, v)| check_value(k, v))
}

/// Decode one JSON value found under `key`.
pub fn value_from_json(key: &str, value: &Json) -> Result<PayloadValue> {
    let decoded = match value {
        Json::Bool(b) => PayloadValue::Bool(*b),
        Json::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => PayloadValue::Int(i),
            (None, Some(f)) => PayloadValue::Float(f),
            (None, None) => {
                return Err(MemoryError::codec(key, format!("number {n} is out of range")));
            }
        },
        Json::String(s) => PayloadValue::String(s.clone()),
        Json::Array(items) => items
            .iter()
            .map(|item| match item {
                Json::String(s) => Ok(s.clone()),
                other => Err(MemoryError::codec(
                    key,
                    format!("lists may only hold strings, found {}", json_kind(other)),
                )),
            })
            .collect::<Result<Vec<_>>>()
            .map(PayloadValue::StringList)?,
        Json::Null => return Err(MemoryError::codec(key, "null values are not supported")),
        Json::Object(_) => return Err(MemoryError::codec(key, "nested objects are not supported")),
    };
    check_value(key, &decoded)?;
    Ok(decoded)
}

fn json_kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

#[cfg(feature = "qdrant")]
pub mod qdrant {
    use std::collections::HashMap;

    use qdrant_client::qdrant::value::Kind;
    use qdrant_client::qdrant::{ListValue, Value};

    use crate::error::{MemoryError, Result};
    use crate::schema::{Payload, PayloadValue};

    pub fn value_to_qdrant(value: &PayloadValue) -> Value {
        let kind = match value {
            PayloadValue::Bool(b) => Kind::BoolValue(*b),
            PayloadValue::Int(i) => Kind::IntegerValue(*i),
            PayloadValue::Float(f) => Kind::DoubleValue(*f),
            PayloadValue::String(s) => Kind::StringValue(s.clone()),
            PayloadValue::StringList(items) => Kind::ListValue(ListValue {
                values: items
                    .iter()
                    .map(|s| Value {
                        kind: Some(Kind::StringValue(s.clone())),
                    })
                    .collect(),
            }),
        };
        Value { kind: Some(kind) }
    }

    pub fn value_from_qdrant(key: &str, value: &Value) -> Result<PayloadValue> {
        match &value.kind {
            Some(Kind::BoolValue(b)) => Ok(PayloadValue::Bool(*b)),
            Some(Kind::IntegerValue(i)) => Ok(PayloadValue::Int(*i)),
            Some(Kind::DoubleValue(f)) => Ok(PayloadValue::Float(*f)),
            Some(Kind::StringValue(s)) => Ok(PayloadValue::String(s.clone())),
            Some(Kind::ListValue(list)) => list
                .values
                .iter()
                .map(|item| match &item.kind {
                    Some(Kind::StringValue(s)) => Ok(s.clone()),
                    _ => Err(MemoryError::codec(key, "lists may only hold strings")),
                })
                .collect::<Result<Vec<_>>>()
                .map(PayloadValue::StringList),
            Some(Kind::StructValue(_)) => {
                Err(MemoryError::codec(key, "nested objects are not supported"))
            }
            Some(Kind::NullValue(_)) | None => {
                Err(MemoryError::codec(key, "null values are not supported"))
            }
        }
    }

    pub fn payload_to_qdrant(payload: &Payload) -> HashMap<String, Value> {
        payload
            .iter()
            .map(|(k, v)| (k.clone(), value_to_qdrant(v)))
            .collect()
    }

    pub fn payload_from_qdrant(raw: &HashMap<String, Value>) -> Result<Payload> {
        raw.iter()
            .map(|(k, v)| value_from_qdrant(k, v).map(|v| (k.clone(), v)))
            .collect()
    }

}
