//! Merging of partial schema fragments into a structural schema and
//! schema-driven defaulting of instance documents.
//!
//! The accepted schema shape is a constrained OpenAPI subset: `type`,
//! `properties`, `items`, `default` and `required`. Fragments are deep-merged
//! (objects recurse, later scalars win, `required` lists are unioned) before
//! the combined document is parsed into a [`StructuralSchema`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("schema fragment must be an object or null, got {actual}"))]
    FragmentNotObject { actual: &'static str },

    #[snafu(display("merged schema fragments do not form a valid structural schema"))]
    InvalidStructure { source: serde_json::Error },
}

/// The JSON types a schema node may declare.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
}

/// A merged, structural schema usable for defaulting.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StructuralSchema {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<SchemaType>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, StructuralSchema>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<StructuralSchema>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

/// Deep-merges `fragments` into a single [`StructuralSchema`].
///
/// `null` fragments contribute nothing. For overlapping keys, objects are
/// combined recursively and later scalars win; `required` lists are unioned
/// and sorted.
pub fn merge_fragments(fragments: &[Value]) -> Result<StructuralSchema> {
    let mut merged = Map::new();
    for fragment in fragments {
        match fragment {
            Value::Null => {}
            Value::Object(map) => merge_schema_node(&mut merged, map),
            other => {
                return FragmentNotObjectSnafu {
                    actual: json_type_name(other),
                }
                .fail();
            }
        }
    }

    let mut schema: StructuralSchema =
        serde_json::from_value(Value::Object(merged)).context(InvalidStructureSnafu)?;
    normalize(&mut schema);
    Ok(schema)
}

/// Merges one schema node. The `required` union and the wholesale `default`
/// replacement apply only here; documents nested inside `default` and
/// property names that collide with keyword names are untouched by either
/// rule.
fn merge_schema_node(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match key.as_str() {
            // `default` carries an instance document, not schema structure;
            // a later fragment replaces it wholesale
            "default" => {
                base.insert(key.clone(), value.clone());
            }
            "required" => {
                if let (Some(Value::Array(existing)), Value::Array(addition)) =
                    (base.get_mut(key), value)
                {
                    existing.extend(addition.iter().cloned());
                } else {
                    base.insert(key.clone(), value.clone());
                }
            }
            "properties" => {
                if let (Some(Value::Object(existing)), Value::Object(overlay_properties)) =
                    (base.get_mut(key), value)
                {
                    for (name, overlay_property) in overlay_properties {
                        if let (Some(Value::Object(base_property)), Value::Object(overlay_child)) =
                            (existing.get_mut(name), overlay_property)
                        {
                            merge_schema_node(base_property, overlay_child);
                        } else {
                            existing.insert(name.clone(), overlay_property.clone());
                        }
                    }
                } else {
                    base.insert(key.clone(), value.clone());
                }
            }
            _ => match (base.get_mut(key), value) {
                // `items` and any forward-compatible object-valued keyword
                (Some(Value::Object(existing)), Value::Object(overlay_child)) => {
                    merge_schema_node(existing, overlay_child);
                }
                _ => {
                    base.insert(key.clone(), value.clone());
                }
            },
        }
    }
}

fn normalize(schema: &mut StructuralSchema) {
    schema.required.sort();
    schema.required.dedup();
    for property in schema.properties.values_mut() {
        normalize(property);
    }
    if let Some(items) = &mut schema.items {
        normalize(items);
    }
}

/// Recursively fills missing keys in `instance` with the defaults declared
/// in `schema`.
///
/// A `null` instance is treated as an empty object. Keys explicitly set to
/// `null` are left alone (caller intent is respected), present values are
/// recursed into, and array element defaults apply to each present item.
/// This function is idempotent and cannot fail.
pub fn apply_defaults(instance: &mut Value, schema: &StructuralSchema) {
    if instance.is_null() {
        *instance = Value::Object(Map::new());
    }
    apply_to(instance, schema);
}

fn apply_to(instance: &mut Value, schema: &StructuralSchema) {
    match instance {
        Value::Object(map) => {
            for (name, property) in &schema.properties {
                if map.contains_key(name) {
                    if let Some(existing) = map.get_mut(name) {
                        if !existing.is_null() {
                            apply_to(existing, property);
                        }
                    }
                } else if let Some(default) = &property.default {
                    let mut value = default.clone();
                    // Defaults nested below a defaulted object still apply
                    apply_to(&mut value, property);
                    map.insert(name.clone(), value);
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = &schema.items {
                for item in items.iter_mut().filter(|item| !item.is_null()) {
                    apply_to(item, item_schema);
                }
            }
        }
        _ => {}
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
