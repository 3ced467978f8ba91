//! The render pipeline: base resources, addon creates, addon patches,
//! validation, enrichment and deterministic ordering.
//!
//! [`Engine::render`] is a pure function over its inputs; the only shared
//! state are the template engine's caches, which are observationally
//! transparent. An [`Engine`] is constructed once and shared across renders,
//! including concurrent ones.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt, Snafu};

mod sort;

use sort::KindPriority;

use crate::{
    context, patch,
    snapshot::{
        AddonSelection, ComponentDeployment, ComponentEnvSnapshot, Document, ForEachSpec,
        MetadataContext, PatchSpec, ResourceSpec,
    },
    template::{self, TemplateEngine, TemplateEngineOptions},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build the base render context"))]
    BuildBaseContext { source: context::Error },

    #[snafu(display("failed to build the context for addon {addon:?}[{instance:?}]"))]
    BuildAddonContext {
        source: context::Error,
        addon: String,
        instance: String,
    },

    #[snafu(display("addon {addon:?} selected as {instance:?} has no definition in the snapshot"))]
    UnknownAddon { addon: String, instance: String },

    #[snafu(display("failed to evaluate forEach of resource {id:?}"))]
    EvalForEach {
        source: template::Error,
        id: String,
    },

    #[snafu(display("forEach of resource {id:?} evaluated to {actual} instead of a list"))]
    ForEachNotList { id: String, actual: &'static str },

    #[snafu(display("failed to evaluate includeWhen of resource {id:?}"))]
    EvalIncludeWhen {
        source: template::Error,
        id: String,
    },

    #[snafu(display("includeWhen of resource {id:?} evaluated to {actual} instead of a boolean"))]
    IncludeWhenNotBool { id: String, actual: &'static str },

    #[snafu(display("failed to render resource {id:?}"))]
    RenderResource {
        source: template::Error,
        id: String,
    },

    #[snafu(display("failed to evaluate the where filter of addon {addon:?}[{instance:?}] patch #{index}"))]
    EvalWhere {
        source: template::Error,
        addon: String,
        instance: String,
        index: usize,
    },

    #[snafu(display(
        "the where filter of addon {addon:?}[{instance:?}] patch #{index} evaluated to {actual} instead of a boolean"
    ))]
    WhereNotBool {
        addon: String,
        instance: String,
        index: usize,
        actual: &'static str,
    },

    #[snafu(display("failed to evaluate forEach of addon {addon:?}[{instance:?}] patch #{index}"))]
    EvalPatchForEach {
        source: template::Error,
        addon: String,
        instance: String,
        index: usize,
    },

    #[snafu(display(
        "forEach of addon {addon:?}[{instance:?}] patch #{index} evaluated to {actual} instead of a list"
    ))]
    PatchForEachNotList {
        addon: String,
        instance: String,
        index: usize,
        actual: &'static str,
    },

    #[snafu(display("failed to render operations of addon {addon:?}[{instance:?}] patch #{index}"))]
    RenderPatchOperations {
        source: template::Error,
        addon: String,
        instance: String,
        index: usize,
    },

    #[snafu(display("addon {addon:?}[{instance:?}] patch #{index} failed on {kind}/{name}"))]
    ApplyPatch {
        source: patch::Error,
        addon: String,
        instance: String,
        index: usize,
        kind: String,
        name: String,
    },

    #[snafu(display("rendered resource {id} is not an object"))]
    ResourceNotAnObject { id: String },

    #[snafu(display("rendered resource {id} is missing a non-empty {field}"))]
    InvalidResource { id: String, field: &'static str },
}

#[derive(Debug, Default)]
pub struct EngineOptions {
    pub template: TemplateEngineOptions,

    /// Kind priority table used for output ordering; `None` selects the
    /// built-in table.
    pub kind_priority: Option<Vec<String>>,
}

/// Everything a single render needs. The snapshot is never mutated.
#[derive(Clone, Debug, Default)]
pub struct RenderInput {
    pub snapshot: ComponentEnvSnapshot,
    pub deployment: Option<ComponentDeployment>,
    pub metadata: MetadataContext,

    /// Common labels added to every resource without overwriting keys set
    /// by templates.
    pub resource_labels: BTreeMap<String, String>,

    /// Common annotations, same non-overwriting semantics as labels.
    pub resource_annotations: BTreeMap<String, String>,
}

/// The ordered list of rendered resource documents. Every element is a JSON
/// object with non-empty `apiVersion`, `kind` and `metadata.name`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderOutput {
    pub resources: Vec<Value>,
}

/// Long-lived render engine. Construct once, share across renders.
pub struct Engine {
    templates: TemplateEngine,
    kind_priority: KindPriority,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            templates: TemplateEngine::new(&options.template),
            kind_priority: KindPriority::new(options.kind_priority),
        }
    }

    /// Renders the snapshot into the ordered resource list. The first
    /// failure aborts the render; partial output is never returned.
    pub fn render(&self, input: &RenderInput) -> Result<RenderOutput> {
        let snapshot = &input.snapshot;
        let base = context::base_context(snapshot, input.deployment.as_ref(), &input.metadata)
            .context(BuildBaseContextSnafu)?;

        let mut resources = Vec::new();

        for spec in &snapshot.component_type.resources {
            self.render_resource_spec(spec, &spec.id, &base, &mut resources)?;
        }

        for selection in &snapshot.component.addons {
            let definition =
                snapshot
                    .addons
                    .get(&selection.name)
                    .with_context(|| UnknownAddonSnafu {
                        addon: &selection.name,
                        instance: &selection.instance_name,
                    })?;
            let addon_ctx =
                context::addon_context(&base, definition, selection, input.deployment.as_ref())
                    .with_context(|_| BuildAddonContextSnafu {
                        addon: &selection.name,
                        instance: &selection.instance_name,
                    })?;

            for spec in &definition.creates {
                let id = format!("{}[{}]/{}", selection.name, selection.instance_name, spec.id);
                self.render_resource_spec(spec, &id, &addon_ctx, &mut resources)?;
            }

            for (index, patch_spec) in definition.patches.iter().enumerate() {
                self.apply_patch_spec(patch_spec, index, selection, &addon_ctx, &mut resources)?;
            }
        }

        validate(&resources)?;
        for resource in &mut resources {
            enrich(resource, &input.resource_labels, &input.resource_annotations);
        }
        self.kind_priority.sort(&mut resources);

        Ok(RenderOutput { resources })
    }

    /// Renders one resource spec: `forEach` expansion, `includeWhen` gate,
    /// template render. Appends results in iteration order.
    fn render_resource_spec(
        &self,
        spec: &ResourceSpec,
        id: &str,
        ctx: &Document,
        resources: &mut Vec<Value>,
    ) -> Result<()> {
        match &spec.for_each {
            Some(for_each) => {
                let items = self.eval_for_each(for_each, ctx, id)?;
                for item in items {
                    let mut item_ctx = ctx.clone();
                    item_ctx.insert(for_each.var.clone(), item);
                    self.render_single(spec, id, &item_ctx, resources)?;
                }
            }
            None => self.render_single(spec, id, ctx, resources)?,
        }
        Ok(())
    }

    fn render_single(
        &self,
        spec: &ResourceSpec,
        id: &str,
        ctx: &Document,
        resources: &mut Vec<Value>,
    ) -> Result<()> {
        if let Some(include_when) = &spec.include_when {
            match self.templates.eval_expr(include_when, ctx) {
                Ok(Value::Bool(true)) => {}
                Ok(Value::Bool(false)) => {
                    tracing::debug!(resource = id, "includeWhen is false, skipping resource");
                    return Ok(());
                }
                Ok(other) => {
                    return IncludeWhenNotBoolSnafu {
                        id,
                        actual: crate::schema::json_type_name(&other),
                    }
                    .fail();
                }
                Err(err) if err.is_missing_data() => {
                    tracing::debug!(
                        resource = id,
                        "includeWhen hit missing data, skipping resource"
                    );
                    return Ok(());
                }
                Err(err) => return Err(err).context(EvalIncludeWhenSnafu { id }),
            }
        }

        let rendered = self
            .templates
            .render(&spec.template, ctx)
            .context(RenderResourceSnafu { id })?;
        resources.push(rendered);
        Ok(())
    }

    /// Evaluates a `forEach` expression to its items. Missing data produces
    /// no items, anything but a list is an error.
    fn eval_for_each(
        &self,
        for_each: &ForEachSpec,
        ctx: &Document,
        id: &str,
    ) -> Result<Vec<Value>> {
        match self.templates.eval_expr(&for_each.expr, ctx) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(other) => ForEachNotListSnafu {
                id,
                actual: crate::schema::json_type_name(&other),
            }
            .fail(),
            Err(err) if err.is_missing_data() => {
                tracing::debug!(resource = id, "forEach hit missing data, producing nothing");
                Ok(Vec::new())
            }
            Err(err) => Err(err).context(EvalForEachSnafu { id }),
        }
    }

    fn apply_patch_spec(
        &self,
        spec: &PatchSpec,
        index: usize,
        selection: &AddonSelection,
        ctx: &Document,
        resources: &mut Vec<Value>,
    ) -> Result<()> {
        let targets = self.find_targets(spec, index, selection, ctx, resources)?;
        if targets.is_empty() {
            tracing::debug!(
                addon = selection.name,
                instance = selection.instance_name,
                patch = index,
                "patch matched no resources"
            );
            return Ok(());
        }

        let iteration_contexts = match &spec.for_each {
            Some(for_each) => {
                let items = match self.templates.eval_expr(&for_each.expr, ctx) {
                    Ok(Value::Array(items)) => items,
                    Ok(other) => {
                        return PatchForEachNotListSnafu {
                            addon: &selection.name,
                            instance: &selection.instance_name,
                            index,
                            actual: crate::schema::json_type_name(&other),
                        }
                        .fail();
                    }
                    Err(err) if err.is_missing_data() => Vec::new(),
                    Err(err) => {
                        return Err(err).context(EvalPatchForEachSnafu {
                            addon: &selection.name,
                            instance: &selection.instance_name,
                            index,
                        });
                    }
                };
                items
                    .into_iter()
                    .map(|item| {
                        let mut item_ctx = ctx.clone();
                        item_ctx.insert(for_each.var.clone(), item);
                        item_ctx
                    })
                    .collect()
            }
            None => vec![ctx.clone()],
        };

        for iteration_ctx in &iteration_contexts {
            let operations = spec
                .operations
                .iter()
                .map(|operation| {
                    let path = self.templates.render_to_string(&operation.path, iteration_ctx)?;
                    let value = operation
                        .value
                        .as_ref()
                        .map(|value| self.templates.render(value, iteration_ctx))
                        .transpose()?;
                    Ok(crate::snapshot::PatchOperation {
                        op: operation.op,
                        path,
                        value,
                    })
                })
                .collect::<Result<Vec<_>, template::Error>>()
                .with_context(|_| RenderPatchOperationsSnafu {
                    addon: &selection.name,
                    instance: &selection.instance_name,
                    index,
                })?;

            for &target in &targets {
                let (kind, name) = kind_and_name(&resources[target]);
                patch::apply(&mut resources[target], &operations).with_context(|_| {
                    ApplyPatchSnafu {
                        addon: &selection.name,
                        instance: &selection.instance_name,
                        index,
                        kind,
                        name,
                    }
                })?;
            }
        }

        Ok(())
    }

    /// Indices of resources matching the patch target by apiVersion and
    /// kind, narrowed by the `where` filter with the candidate bound as
    /// `resource`. Missing data in `where` excludes the candidate.
    fn find_targets(
        &self,
        spec: &PatchSpec,
        index: usize,
        selection: &AddonSelection,
        ctx: &Document,
        resources: &[Value],
    ) -> Result<Vec<usize>> {
        let mut targets = Vec::new();
        for (position, resource) in resources.iter().enumerate() {
            let api_version = resource.get("apiVersion").and_then(Value::as_str);
            let kind = resource.get("kind").and_then(Value::as_str);
            if api_version != Some(spec.target.api_version.as_str())
                || kind != Some(spec.target.kind.as_str())
            {
                continue;
            }

            if let Some(where_filter) = &spec.target.r#where {
                let mut candidate_ctx = ctx.clone();
                candidate_ctx.insert("resource".to_owned(), resource.clone());
                match self.templates.eval_expr(where_filter, &candidate_ctx) {
                    Ok(Value::Bool(true)) => {}
                    Ok(Value::Bool(false)) => continue,
                    Ok(other) => {
                        return WhereNotBoolSnafu {
                            addon: &selection.name,
                            instance: &selection.instance_name,
                            index,
                            actual: crate::schema::json_type_name(&other),
                        }
                        .fail();
                    }
                    Err(err) if err.is_missing_data() => continue,
                    Err(err) => {
                        return Err(err).context(EvalWhereSnafu {
                            addon: &selection.name,
                            instance: &selection.instance_name,
                            index,
                        });
                    }
                }
            }

            targets.push(position);
        }
        Ok(targets)
    }
}

/// Every rendered resource must carry non-empty `apiVersion`, `kind` and
/// `metadata.name`.
fn validate(resources: &[Value]) -> Result<()> {
    for (position, resource) in resources.iter().enumerate() {
        let id = resource_id(resource, position);
        if !resource.is_object() {
            return ResourceNotAnObjectSnafu { id }.fail();
        }

        for (field, pointer) in [
            ("apiVersion", "/apiVersion"),
            ("kind", "/kind"),
            ("metadata.name", "/metadata/name"),
        ] {
            let present = resource
                .pointer(pointer)
                .and_then(Value::as_str)
                .is_some_and(|value| !value.is_empty());
            if !present {
                return InvalidResourceSnafu { id, field }.fail();
            }
        }
    }
    Ok(())
}

/// Merges common labels and annotations into the resource without
/// overwriting keys set by templates.
fn enrich(
    resource: &mut Value,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) {
    for (field, entries) in [("labels", labels), ("annotations", annotations)] {
        if entries.is_empty() {
            continue;
        }
        let Some(metadata) = resource
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        else {
            continue;
        };
        let slot = metadata
            .entry(field.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(target) = slot.as_object_mut() else {
            continue;
        };
        for (key, value) in entries {
            if !target.contains_key(key) {
                target.insert(key.clone(), Value::String(value.clone()));
            }
        }
    }
}

fn resource_id(resource: &Value, position: usize) -> String {
    let (kind, name) = kind_and_name(resource);
    if kind.is_empty() && name.is_empty() {
        format!("#{position}")
    } else {
        format!("{kind}/{name}")
    }
}

fn kind_and_name(resource: &Value) -> (String, String) {
    let kind = resource
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let name = resource
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    (kind, name)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn validate_rejects_missing_fields() {
        let err = validate(&[json!({"kind": "Deployment", "metadata": {"name": "a"}})])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidResource {
                field: "apiVersion",
                ..
            }
        ));

        let err = validate(&[json!({
            "apiVersion": "v1",
            "kind": "",
            "metadata": {"name": "a"},
        })])
        .unwrap_err();
        assert!(matches!(err, Error::InvalidResource { field: "kind", .. }));

        let err = validate(&[json!([1])]).unwrap_err();
        assert!(matches!(err, Error::ResourceNotAnObject { .. }));
    }

    #[test]
    fn enrich_adds_only_absent_keys() {
        let mut resource = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "labels": {"owner": "template"}},
        });
        let labels = BTreeMap::from([
            ("owner".to_owned(), "caller".to_owned()),
            ("env".to_owned(), "dev".to_owned()),
        ]);
        enrich(&mut resource, &labels, &BTreeMap::new());

        assert_eq!(
            resource["metadata"]["labels"],
            json!({"owner": "template", "env": "dev"})
        );
        // No annotations were supplied, so none are created
        assert_eq!(resource["metadata"].get("annotations"), None);
    }

    #[test]
    fn enrich_creates_missing_maps() {
        let mut resource = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
        });
        let annotations = BTreeMap::from([("note".to_owned(), "hello".to_owned())]);
        enrich(&mut resource, &BTreeMap::new(), &annotations);
        assert_eq!(
            resource["metadata"]["annotations"],
            json!({"note": "hello"})
        );
    }
}
