//! Custom CEL helper functions available in every template expression.

use std::{collections::HashMap, sync::Arc};

use cel_interpreter::{
    Context, ExecutionError, Value as CelValue,
    extractors::Arguments,
    objects::{Key, Map as CelMap},
};

use super::value::cel_type_name;

/// Sentinel returned by `omit()`. Map entries and list elements whose
/// rendered value equals this marker are pruned from the output.
pub(crate) const OMIT_MARKER: &str = "__choreo_omit_sentinel__";

/// DNS label length limit (RFC 1123), the same bound Kubernetes enforces on
/// most resource names.
const RFC_1123_LABEL_MAX_LENGTH: usize = 63;

pub(crate) fn register(context: &mut Context<'_>) {
    context.add_function("omit", omit);
    context.add_function("merge", merge);
    context.add_function("sanitizeK8sResourceName", sanitize_k8s_resource_name);
}

fn omit() -> Result<CelValue, ExecutionError> {
    Ok(CelValue::String(Arc::new(OMIT_MARKER.to_owned())))
}

/// Shallow overlay of map `overlay` onto map `base`: top-level keys of
/// `overlay` win, everything else is kept from `base`.
fn merge(base: CelValue, overlay: CelValue) -> Result<CelValue, ExecutionError> {
    match (&base, &overlay) {
        (CelValue::Map(base), CelValue::Map(overlay)) => {
            let mut merged: HashMap<Key, CelValue> = base.map.as_ref().clone();
            for (key, value) in overlay.map.iter() {
                merged.insert(key.clone(), value.clone());
            }
            Ok(CelValue::Map(CelMap {
                map: Arc::new(merged),
            }))
        }
        _ => Err(ExecutionError::FunctionError {
            function: "merge".to_owned(),
            message: format!(
                "both arguments must be maps, got {} and {}",
                cel_type_name(&base),
                cel_type_name(&overlay)
            ),
        }),
    }
}

/// Builds a DNS-compatible resource name from the given parts: each part is
/// lowercased and stripped to `[a-z0-9]`, parts are joined with `-`, and the
/// result is truncated to the RFC 1123 label length.
fn sanitize_k8s_resource_name(Arguments(parts): Arguments) -> Result<CelValue, ExecutionError> {
    if parts.is_empty() {
        return Err(ExecutionError::FunctionError {
            function: "sanitizeK8sResourceName".to_owned(),
            message: "at least one part is required".to_owned(),
        });
    }

    let mut sanitized = Vec::new();
    for part in parts.iter() {
        let raw = stringify_part(part)?;
        let cleaned: String = raw
            .to_lowercase()
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        if !cleaned.is_empty() {
            sanitized.push(cleaned);
        }
    }

    let mut name = sanitized.join("-");
    name.truncate(RFC_1123_LABEL_MAX_LENGTH);
    let name = name.trim_matches('-').to_owned();
    if name.is_empty() {
        return Err(ExecutionError::FunctionError {
            function: "sanitizeK8sResourceName".to_owned(),
            message: "no usable characters left after sanitizing".to_owned(),
        });
    }

    Ok(CelValue::String(Arc::new(name)))
}

fn stringify_part(part: &CelValue) -> Result<String, ExecutionError> {
    match part {
        CelValue::String(value) => Ok(value.as_ref().clone()),
        CelValue::Int(value) => Ok(value.to_string()),
        CelValue::UInt(value) => Ok(value.to_string()),
        CelValue::Float(value) => Ok(value.to_string()),
        CelValue::Bool(value) => Ok(value.to_string()),
        other => Err(ExecutionError::FunctionError {
            function: "sanitizeK8sResourceName".to_owned(),
            message: format!("cannot use a {} as a name part", cel_type_name(other)),
        }),
    }
}
