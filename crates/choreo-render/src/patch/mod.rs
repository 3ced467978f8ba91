//! Application of an ordered list of patch operations to a single document.
//!
//! Supported operations are RFC 6902 `add`, `replace` and `remove` plus the
//! custom `mergeShallow`, addressed by the extended path syntax from
//! [`path`]. Targeting patches to many documents is the pipeline's concern;
//! this module only ever mutates the one document it is given.
//!
//! Unknown operation names never reach this module: they are rejected when
//! the patch spec is deserialized into [`PatchOp`].

use serde_json::{Map, Value};
use snafu::Snafu;

mod path;

use path::Segment;

use crate::{
    schema::json_type_name,
    snapshot::{PatchOp, PatchOperation},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unclosed bracket in path segment {segment:?}"))]
    UnclosedBracket { segment: String },

    #[snafu(display(
        "unsupported filter {segment:?}, only [?(@.field.path=='value')] is supported"
    ))]
    UnsupportedFilter { segment: String },

    #[snafu(display("array index {index} out of bounds (length {len}) in path {path:?}"))]
    ArrayIndexOutOfBounds {
        index: usize,
        len: usize,
        path: String,
    },

    #[snafu(display("expected {expected} but found {actual} at segment {segment:?} of path {path:?}"))]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
        segment: String,
        path: String,
    },

    #[snafu(display("path {path:?} does not resolve"))]
    MissingPath { path: String },

    #[snafu(display("operation {op} on path {path:?} requires a value"))]
    MissingValue { op: PatchOp, path: String },

    #[snafu(display("mergeShallow on path {path:?} requires an object value"))]
    MergeValueNotObject { path: String },
}

/// Applies `operations` in order to `document`. The first failing operation
/// aborts; earlier operations remain applied, callers treat the document as
/// poisoned on error.
pub fn apply(document: &mut Value, operations: &[PatchOperation]) -> Result<()> {
    for operation in operations {
        apply_operation(document, operation)?;
    }
    Ok(())
}

fn apply_operation(document: &mut Value, operation: &PatchOperation) -> Result<()> {
    let segments = path::parse(&operation.path)?;

    // `-` is only legal as the final segment of an `add`
    if let Some(position) = segments.iter().position(|segment| *segment == Segment::Append) {
        if position != segments.len() - 1 || operation.op != PatchOp::Add {
            return MissingPathSnafu {
                path: &operation.path,
            }
            .fail();
        }
    }

    if operation.op == PatchOp::MergeShallow
        && !matches!(operation.value, Some(Value::Object(_)))
    {
        return MergeValueNotObjectSnafu {
            path: &operation.path,
        }
        .fail();
    }

    apply_at(document, &segments, operation)
}

fn apply_at(target: &mut Value, segments: &[Segment], operation: &PatchOperation) -> Result<()> {
    match segments {
        [] => apply_to_root(target, operation),
        [last] => apply_final(target, last, operation),
        [segment, rest @ ..] => descend(target, segment, rest, operation),
    }
}

fn descend(
    target: &mut Value,
    segment: &Segment,
    rest: &[Segment],
    operation: &PatchOperation,
) -> Result<()> {
    match segment {
        Segment::Field(name) => {
            let Value::Object(map) = target else {
                return type_mismatch("object", target, segment, operation);
            };
            if !map.contains_key(name) {
                if operation.op == PatchOp::Add {
                    // Auto-create a parent container when its shape is
                    // inferable from the next segment
                    match rest.first() {
                        Some(Segment::Field(_)) => {
                            map.insert(name.clone(), Value::Object(Map::new()));
                        }
                        Some(Segment::Append) => {
                            map.insert(name.clone(), Value::Array(Vec::new()));
                        }
                        _ => {
                            return MissingPathSnafu {
                                path: &operation.path,
                            }
                            .fail();
                        }
                    }
                } else {
                    return MissingPathSnafu {
                        path: &operation.path,
                    }
                    .fail();
                }
            }
            match map.get_mut(name) {
                Some(child) => apply_at(child, rest, operation),
                None => MissingPathSnafu {
                    path: &operation.path,
                }
                .fail(),
            }
        }
        Segment::Index(index) => {
            let Value::Array(items) = target else {
                return type_mismatch("array", target, segment, operation);
            };
            let len = items.len();
            match items.get_mut(*index) {
                Some(item) => apply_at(item, rest, operation),
                None => ArrayIndexOutOfBoundsSnafu {
                    index: *index,
                    len,
                    path: &operation.path,
                }
                .fail(),
            }
        }
        Segment::Filter { field, value } => {
            let Value::Array(items) = target else {
                return type_mismatch("array", target, segment, operation);
            };
            // Zero matches is a no-op, not an error
            for item in items
                .iter_mut()
                .filter(|item| matches_filter(item, field, value))
            {
                apply_at(item, rest, operation)?;
            }
            Ok(())
        }
        // Non-final `-` is rejected up front
        Segment::Append => MissingPathSnafu {
            path: &operation.path,
        }
        .fail(),
    }
}

fn apply_final(container: &mut Value, segment: &Segment, operation: &PatchOperation) -> Result<()> {
    match segment {
        Segment::Field(name) => {
            let Value::Object(map) = container else {
                return type_mismatch("object", container, segment, operation);
            };
            match operation.op {
                PatchOp::Add => {
                    map.insert(name.clone(), required_value(operation)?.clone());
                }
                PatchOp::Replace => {
                    if !map.contains_key(name) {
                        return MissingPathSnafu {
                            path: &operation.path,
                        }
                        .fail();
                    }
                    map.insert(name.clone(), required_value(operation)?.clone());
                }
                PatchOp::Remove => {
                    if map.remove(name).is_none() {
                        return MissingPathSnafu {
                            path: &operation.path,
                        }
                        .fail();
                    }
                }
                PatchOp::MergeShallow => {
                    let slot = map.entry(name.clone()).or_insert(Value::Null);
                    merge_shallow(slot, required_value(operation)?);
                }
            }
            Ok(())
        }
        Segment::Index(index) => {
            let Value::Array(items) = container else {
                return type_mismatch("array", container, segment, operation);
            };
            let len = items.len();
            let out_of_bounds = || {
                ArrayIndexOutOfBoundsSnafu {
                    index: *index,
                    len,
                    path: &operation.path,
                }
                .fail()
            };
            match operation.op {
                PatchOp::Add => {
                    // RFC 6902 add inserts before the index
                    if *index > len {
                        return out_of_bounds();
                    }
                    items.insert(*index, required_value(operation)?.clone());
                }
                PatchOp::Replace => match items.get_mut(*index) {
                    Some(item) => *item = required_value(operation)?.clone(),
                    None => return out_of_bounds(),
                },
                PatchOp::Remove => {
                    if *index >= len {
                        return out_of_bounds();
                    }
                    items.remove(*index);
                }
                PatchOp::MergeShallow => match items.get_mut(*index) {
                    Some(item) => merge_shallow(item, required_value(operation)?),
                    None => return out_of_bounds(),
                },
            }
            Ok(())
        }
        Segment::Append => {
            let Value::Array(items) = container else {
                return type_mismatch("array", container, segment, operation);
            };
            // Only reachable for `add`, enforced in apply_operation
            items.push(required_value(operation)?.clone());
            Ok(())
        }
        Segment::Filter { field, value } => {
            let Value::Array(items) = container else {
                return type_mismatch("array", container, segment, operation);
            };
            match operation.op {
                PatchOp::Add | PatchOp::Replace => {
                    let replacement = required_value(operation)?;
                    for item in items
                        .iter_mut()
                        .filter(|item| matches_filter(item, field, value))
                    {
                        *item = replacement.clone();
                    }
                }
                PatchOp::MergeShallow => {
                    let overlay = required_value(operation)?;
                    for item in items
                        .iter_mut()
                        .filter(|item| matches_filter(item, field, value))
                    {
                        merge_shallow(item, overlay);
                    }
                }
                PatchOp::Remove => {
                    items.retain(|item| !matches_filter(item, field, value));
                }
            }
            Ok(())
        }
    }
}

fn apply_to_root(target: &mut Value, operation: &PatchOperation) -> Result<()> {
    match operation.op {
        PatchOp::Add | PatchOp::Replace => {
            *target = required_value(operation)?.clone();
            Ok(())
        }
        PatchOp::MergeShallow => {
            merge_shallow(target, required_value(operation)?);
            Ok(())
        }
        PatchOp::Remove => MissingPathSnafu {
            path: &operation.path,
        }
        .fail(),
    }
}

/// Top-level-only overlay: existing object keys are preserved except where
/// overlaid, nested objects are replaced whole. A non-object target is
/// replaced by a deep copy of the value.
fn merge_shallow(target: &mut Value, overlay: &Value) {
    match (target.as_object_mut(), overlay.as_object()) {
        (Some(target_map), Some(overlay_map)) => {
            for (key, value) in overlay_map {
                target_map.insert(key.clone(), value.clone());
            }
        }
        _ => *target = overlay.clone(),
    }
}

fn matches_filter(element: &Value, field: &[String], expected: &Value) -> bool {
    let mut current = element;
    for part in field {
        match current.get(part) {
            Some(next) => current = next,
            None => return false,
        }
    }
    current == expected
}

fn required_value(operation: &PatchOperation) -> Result<&Value> {
    operation.value.as_ref().ok_or_else(|| {
        MissingValueSnafu {
            op: operation.op,
            path: &operation.path,
        }
        .build()
    })
}

fn type_mismatch(
    expected: &'static str,
    actual: &Value,
    segment: &Segment,
    operation: &PatchOperation,
) -> Result<()> {
    TypeMismatchSnafu {
        expected,
        actual: json_type_name(actual),
        segment: format!("{segment:?}"),
        path: &operation.path,
    }
    .fail()
}
