//! Conversion between [`serde_json::Value`] trees and CEL values.
//!
//! Rendered documents always travel as JSON values; CEL values only exist
//! for the duration of a single expression evaluation. Converting maps back
//! to JSON goes through [`serde_json::Map`], which keeps keys sorted and
//! therefore the output deterministic.

use std::{collections::HashMap, sync::Arc};

use cel_interpreter::{
    Value as CelValue,
    objects::{Key, Map as CelMap},
};
use serde_json::{Map, Number, Value};

use super::{Error, UnrepresentableValueSnafu};

pub(crate) fn json_to_cel(value: &Value) -> CelValue {
    match value {
        Value::Null => CelValue::Null,
        Value::Bool(value) => CelValue::Bool(*value),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                CelValue::Int(int)
            } else if let Some(uint) = number.as_u64() {
                CelValue::UInt(uint)
            } else {
                CelValue::Float(number.as_f64().unwrap_or_default())
            }
        }
        Value::String(string) => CelValue::String(Arc::new(string.clone())),
        Value::Array(items) => CelValue::List(Arc::new(items.iter().map(json_to_cel).collect())),
        Value::Object(map) => {
            let converted: HashMap<Key, CelValue> = map
                .iter()
                .map(|(key, value)| (Key::String(Arc::new(key.clone())), json_to_cel(value)))
                .collect();
            CelValue::Map(CelMap {
                map: Arc::new(converted),
            })
        }
    }
}

pub(crate) fn cel_to_json(value: &CelValue) -> Result<Value, Error> {
    match value {
        CelValue::Null => Ok(Value::Null),
        CelValue::Bool(value) => Ok(Value::Bool(*value)),
        CelValue::Int(value) => Ok(Value::Number(Number::from(*value))),
        CelValue::UInt(value) => Ok(Value::Number(Number::from(*value))),
        CelValue::Float(value) => Number::from_f64(*value).map(Value::Number).ok_or_else(|| {
            UnrepresentableValueSnafu {
                kind: "non-finite float",
            }
            .build()
        }),
        CelValue::String(value) => Ok(Value::String(value.as_ref().clone())),
        CelValue::List(items) => items
            .iter()
            .map(cel_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        CelValue::Map(map) => {
            let mut converted = Map::new();
            for (key, value) in map.map.iter() {
                converted.insert(key_to_string(key), cel_to_json(value)?);
            }
            Ok(Value::Object(converted))
        }
        other => UnrepresentableValueSnafu {
            kind: cel_type_name(other),
        }
        .fail(),
    }
}

fn key_to_string(key: &Key) -> String {
    match key {
        Key::String(value) => value.as_ref().clone(),
        Key::Int(value) => value.to_string(),
        Key::Uint(value) => value.to_string(),
        Key::Bool(value) => value.to_string(),
    }
}

pub(crate) fn cel_type_name(value: &CelValue) -> &'static str {
    match value {
        CelValue::Null => "null",
        CelValue::Bool(_) => "bool",
        CelValue::Int(_) => "int",
        CelValue::UInt(_) => "uint",
        CelValue::Float(_) => "double",
        CelValue::String(_) => "string",
        CelValue::Bytes(_) => "bytes",
        CelValue::List(_) => "list",
        CelValue::Map(_) => "map",
        _ => "opaque",
    }
}
