use super::SyncError;
use crate::node::Props;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::sync::Arc;
use yrs::{Any, Array, ArrayRef, GetString, Map as _, MapRef, Out, ReadTxn};

// Largest integer an f64 carries exactly.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

pub(crate) fn any_str(value: &str) -> Any {
    Any::String(Arc::from(value))
}

pub(crate) fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) if i.unsigned_abs() <= MAX_SAFE_INTEGER as u64 => Any::Number(i as f64),
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => any_str(s),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect::<Vec<_>>().into()),
        Value::Object(map) => Any::Map(Arc::new(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect::<HashMap<_, _>>(),
        )),
    }
}

pub(crate) fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(f) => number_to_json(*f),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), any_to_json(v))).collect()),
    }
}

// Integral floats come back as integers so a value survives the trip
// through the replica unchanged.
fn number_to_json(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER as f64 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map_or(Value::Null, Value::Number)
    }
}

/// Reads every property of a props map. Nested shared types are not
/// property values and are skipped.
pub(crate) fn read_props<T: ReadTxn>(props: &MapRef, txn: &T) -> Props {
    let mut out = Props::new();
    for (key, value) in props.iter(txn) {
        if let Out::Any(any) = value {
            out.insert(key.to_string(), any_to_json(&any));
        }
    }
    out
}

/// Reads a static string tag from a node map.
pub(crate) fn read_tag<T: ReadTxn>(map: &MapRef, txn: &T, key: &'static str) -> Result<String, SyncError> {
    match map.get(txn, key) {
        Some(Out::Any(Any::String(s))) => Ok(s.to_string()),
        _ => Err(SyncError::MissingAttribute(key)),
    }
}

/// JSON dump of any replica value, descending into shared types.
pub(crate) fn out_to_json<T: ReadTxn>(value: &Out, txn: &T) -> Value {
    match value {
        Out::Any(any) => any_to_json(any),
        Out::YMap(map) => Value::Object(
            map.iter(txn)
                .map(|(k, v)| (k.to_string(), out_to_json(&v, txn)))
                .collect::<Map<_, _>>(),
        ),
        Out::YArray(array) => array_to_json(array, txn),
        Out::YText(text) => Value::String(text.get_string(txn)),
        _ => Value::Null,
    }
}

pub(crate) fn array_to_json<T: ReadTxn>(array: &ArrayRef, txn: &T) -> Value {
    Value::Array(array.iter(txn).map(|v| out_to_json(&v, txn)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip_keeps_integers() {
        let value = json!({"indent": 2, "ratio": 0.5, "tags": ["a", null, true], "big": 9007199254740993i64});
        assert_eq!(any_to_json(&json_to_any(&value)), value);
    }

    #[test]
    fn test_extreme_integers_are_kept_exact() {
        assert_eq!(json_to_any(&json!(i64::MIN)), Any::BigInt(i64::MIN));
        assert_eq!(json_to_any(&json!(i64::MAX)), Any::BigInt(i64::MAX));
        assert_eq!(json_to_any(&json!(-MAX_SAFE_INTEGER)), Any::Number(-MAX_SAFE_INTEGER as f64));
        assert_eq!(any_to_json(&json_to_any(&json!(i64::MIN))), json!(i64::MIN));
    }

    #[test]
    fn test_integral_float_becomes_integer() {
        assert_eq!(any_to_json(&Any::Number(3.0)), json!(3));
    }
}
