//! Construction of the CEL evaluation contexts for component-base renders
//! and addon renders, including the three-layer parameter precedence:
//! schema defaults (lowest) → instance parameters → per-environment override
//! (highest).

use serde_json::{Map, Value, json};
use snafu::{ResultExt, Snafu};

use crate::{
    schema,
    snapshot::{
        AddonDefinition, AddonSelection, ComponentDeployment, ComponentEnvSnapshot, Document,
        MetadataContext, ValueRef, Workload,
    },
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to merge parameter schema fragments"))]
    MergeSchema { source: schema::Error },

    #[snafu(display("failed to serialize the metadata context"))]
    SerializeMetadata { source: serde_json::Error },
}

/// Deep merge: where both sides hold objects the keys are combined
/// recursively, everything else is replaced by a deep copy of the overlay.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base.as_object_mut(), overlay.as_object()) {
        (Some(base_map), Some(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && overlay_value.is_object() => {
                        deep_merge(base_value, overlay_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        _ => *base = overlay.clone(),
    }
}

/// Builds the evaluation context for component-base resources.
pub fn base_context(
    snapshot: &ComponentEnvSnapshot,
    deployment: Option<&ComponentDeployment>,
    metadata: &MetadataContext,
) -> Result<Document> {
    let overrides = deployment.and_then(|deployment| deployment.overrides.as_ref());

    let mut parameters = Value::Object(snapshot.component.parameters.clone());
    if let Some(overrides) = overrides {
        deep_merge(&mut parameters, &Value::Object(overrides.parameters.clone()));
    }
    let parameter_schema = schema::merge_fragments(&[
        snapshot.component_type.parameter_schema.clone(),
        snapshot.component_type.env_override_schema.clone(),
    ])
    .context(MergeSchemaSnafu)?;
    schema::apply_defaults(&mut parameters, &parameter_schema);

    let mut context = Map::new();
    context.insert("parameters".to_owned(), parameters);
    context.insert("workload".to_owned(), workload_context(&snapshot.workload));
    context.insert(
        "configurations".to_owned(),
        configurations_context(&snapshot.workload),
    );
    context.insert(
        "component".to_owned(),
        json!({
            "name": snapshot.component.name,
            "namespace": snapshot.component.namespace,
        }),
    );
    context.insert(
        "environment".to_owned(),
        Value::String(snapshot.environment.clone()),
    );
    context.insert(
        "metadata".to_owned(),
        serde_json::to_value(metadata).context(SerializeMetadataSnafu)?,
    );
    Ok(context)
}

/// Builds the evaluation context for one addon instance: same shape as the
/// base context, with the addon's own parameter layers and an `addon` block.
pub fn addon_context(
    base: &Document,
    definition: &AddonDefinition,
    selection: &AddonSelection,
    deployment: Option<&ComponentDeployment>,
) -> Result<Document> {
    let mut parameters = Value::Object(selection.parameters.clone());
    let instance_overrides = deployment
        .and_then(|deployment| deployment.overrides.as_ref())
        .and_then(|overrides| overrides.addons.get(&selection.instance_name));
    if let Some(instance_overrides) = instance_overrides {
        deep_merge(&mut parameters, &Value::Object(instance_overrides.clone()));
    }
    let parameter_schema = schema::merge_fragments(&[
        definition.parameter_schema.clone(),
        definition.env_override_schema.clone(),
    ])
    .context(MergeSchemaSnafu)?;
    schema::apply_defaults(&mut parameters, &parameter_schema);

    let mut context = base.clone();
    context.insert("parameters".to_owned(), parameters);
    context.insert(
        "addon".to_owned(),
        json!({
            "name": selection.name,
            "instanceName": selection.instance_name,
        }),
    );
    Ok(context)
}

/// The `workload` block: name plus container images/commands/args, endpoints
/// and connections.
fn workload_context(workload: &Workload) -> Value {
    let containers: Map<String, Value> = workload
        .containers
        .iter()
        .map(|(name, container)| {
            (
                name.clone(),
                json!({
                    "image": container.image,
                    "command": container.command,
                    "args": container.args,
                }),
            )
        })
        .collect();

    let endpoints: Map<String, Value> = workload
        .endpoints
        .iter()
        .map(|(name, endpoint)| {
            (
                name.clone(),
                serde_json::to_value(endpoint).unwrap_or(Value::Null),
            )
        })
        .collect();

    json!({
        "name": workload.name,
        "containers": containers,
        "endpoints": endpoints,
        "connections": workload.connections,
    })
}

/// The `configurations` block: env and file entries partitioned into
/// `configs` (direct values and configuration-group references) and
/// `secrets` (secret references). All four sub-lists always exist so
/// templates can iterate without null checks.
fn configurations_context(workload: &Workload) -> Value {
    let mut config_envs = Vec::new();
    let mut config_files = Vec::new();
    let mut secret_envs = Vec::new();
    let mut secret_files = Vec::new();

    for (container_name, container) in &workload.containers {
        for env in &container.env {
            let mut entry = Map::new();
            entry.insert("container".to_owned(), json!(container_name));
            entry.insert("key".to_owned(), json!(env.key));
            match &env.value_from {
                Some(ValueRef::SecretRef { name, key }) => {
                    entry.insert("secret".to_owned(), json!(name));
                    entry.insert("secretKey".to_owned(), json!(key));
                    secret_envs.push(Value::Object(entry));
                }
                Some(ValueRef::ConfigurationGroupRef { name, key }) => {
                    entry.insert("configurationGroup".to_owned(), json!(name));
                    entry.insert("configurationKey".to_owned(), json!(key));
                    config_envs.push(Value::Object(entry));
                }
                None => {
                    entry.insert("value".to_owned(), json!(env.value));
                    config_envs.push(Value::Object(entry));
                }
            }
        }

        for file in &container.files {
            let mut entry = Map::new();
            entry.insert("container".to_owned(), json!(container_name));
            entry.insert("path".to_owned(), json!(file.path));
            match &file.value_from {
                Some(ValueRef::SecretRef { name, key }) => {
                    entry.insert("secret".to_owned(), json!(name));
                    entry.insert("secretKey".to_owned(), json!(key));
                    secret_files.push(Value::Object(entry));
                }
                Some(ValueRef::ConfigurationGroupRef { name, key }) => {
                    entry.insert("configurationGroup".to_owned(), json!(name));
                    entry.insert("configurationKey".to_owned(), json!(key));
                    config_files.push(Value::Object(entry));
                }
                None => {
                    entry.insert("value".to_owned(), json!(file.value));
                    config_files.push(Value::Object(entry));
                }
            }
        }
    }

    json!({
        "configs": {"envs": config_envs, "files": config_files},
        "secrets": {"envs": secret_envs, "files": secret_files},
    })
}
