//! Input records for a render: the frozen [`ComponentEnvSnapshot`] bundle,
//! the optional per-environment [`ComponentDeployment`] override and the
//! caller-supplied [`MetadataContext`].
//!
//! All free-form documents (parameters, overrides, templates) are plain
//! [`serde_json`] values. The pipeline never mutates any of these inputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A free-form JSON object, as used for parameters and overrides.
pub type Document = Map<String, Value>;

/// Everything needed to render one component in one environment.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentEnvSnapshot {
    pub component: Component,

    /// The template catalogue for the component's type.
    pub component_type: ComponentTypeDefinition,

    #[serde(default)]
    pub workload: Workload,

    /// Definitions for every addon selected by the component, keyed by addon
    /// name. Selections referencing a missing definition fail the render.
    #[serde(default)]
    pub addons: BTreeMap<String, AddonDefinition>,

    pub environment: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    pub namespace: String,

    #[serde(default)]
    pub parameters: Document,

    /// Addon instances selected by this component, in declaration order.
    #[serde(default)]
    pub addons: Vec<AddonSelection>,
}

/// One selected addon instance. The same addon can be selected multiple
/// times under different instance names.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddonSelection {
    pub name: String,
    pub instance_name: String,

    #[serde(default)]
    pub parameters: Document,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentTypeDefinition {
    /// Partial schema fragment for component parameters.
    #[serde(default)]
    pub parameter_schema: Value,

    /// Partial schema fragment for per-environment overrides.
    #[serde(default)]
    pub env_override_schema: Value,

    /// Resource templates to render, in order.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// One templated resource to render.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// Stable identifier within the owning CTD or addon.
    pub id: String,

    /// Arbitrary JSON/YAML tree containing `${...}` expressions.
    pub template: Value,

    /// Boolean expression gating the resource. Missing data evaluates to
    /// false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_when: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEachSpec>,
}

/// A `forEach` iteration: evaluate `expr` to a list and bind each item under
/// `var` in a cloned context.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForEachSpec {
    pub expr: String,
    pub var: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddonDefinition {
    pub name: String,

    #[serde(default)]
    pub parameter_schema: Value,

    #[serde(default)]
    pub env_override_schema: Value,

    /// Resources this addon adds, in order.
    #[serde(default)]
    pub creates: Vec<ResourceSpec>,

    /// Modifications this addon applies to already-rendered resources, in
    /// order.
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
}

/// One targeted modification of rendered resources.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatchSpec {
    pub target: PatchTarget,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEachSpec>,

    #[serde(default)]
    pub operations: Vec<PatchOperation>,
}

/// Selects resources by apiVersion and kind, optionally narrowed by a
/// `where` expression evaluated with the candidate bound as `resource`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatchTarget {
    pub api_version: String,
    pub kind: String,

    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub r#where: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperation {
    pub op: PatchOp,

    /// Extended JSON Pointer, may contain `${...}` expressions.
    pub path: String,

    /// Required for `add`, `replace` and `mergeShallow`; may contain
    /// `${...}` expressions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, strum::Display)]
pub enum PatchOp {
    #[serde(rename = "add")]
    #[strum(serialize = "add")]
    Add,

    #[serde(rename = "replace")]
    #[strum(serialize = "replace")]
    Replace,

    #[serde(rename = "remove")]
    #[strum(serialize = "remove")]
    Remove,

    /// Top-level-only object overlay, see the patch module for semantics.
    #[serde(rename = "mergeShallow")]
    #[strum(serialize = "mergeShallow")]
    MergeShallow,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub containers: BTreeMap<String, Container>,

    #[serde(default)]
    pub endpoints: BTreeMap<String, Endpoint>,

    /// Connection descriptors to other components, shape is free-form.
    #[serde(default)]
    pub connections: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub files: Vec<FileMount>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueRef>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMount {
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueRef>,
}

/// Indirect value source for env/file entries. Configuration-group
/// references count as plain configuration, secret references as secrets.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ValueRef {
    #[serde(rename_all = "camelCase")]
    ConfigurationGroupRef { name: String, key: String },

    #[serde(rename_all = "camelCase")]
    SecretRef { name: String, key: String },
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub port: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Per-environment deployment record carrying the override document.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDeployment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<OverrideDocument>,
}

/// Caller-supplied per-environment overlay. `parameters` deep-merges over
/// the component parameters, each `addons` entry (keyed by instance name)
/// deep-merges over that instance's parameters.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OverrideDocument {
    #[serde(default)]
    pub parameters: Document,

    #[serde(default)]
    pub addons: BTreeMap<String, Document>,
}

/// Caller-computed naming and labelling envelope, injected into every
/// template context under `metadata`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataContext {
    pub name: String,
    pub namespace: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub pod_selectors: BTreeMap<String, String>,
}
