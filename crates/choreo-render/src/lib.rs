//! Rendering of component environment snapshots into ordered lists of
//! Kubernetes resource documents.
//!
//! A snapshot bundles a component, its component type definition, the
//! selected addons and the target environment. [`Engine::render`] turns it
//! into concrete resources in five stages: build the evaluation context,
//! render the component type's resource templates, render addon-created
//! resources, apply addon patches, then validate, enrich and sort the
//! result.
//!
//! Templates are JSON documents whose strings may embed `${...}` CEL
//! expressions; see the [`template`] module for the exact splicing and
//! type-preservation rules. Parameter documents are validated and defaulted
//! against structural schemas by the [`schema`] module. Patches use an
//! extended JSON Pointer syntax handled by the [`patch`] module.

pub mod context;
pub mod patch;
pub mod pipeline;
pub mod schema;
pub mod snapshot;
pub mod template;

pub use pipeline::{Engine, EngineOptions, RenderInput, RenderOutput};
pub use snapshot::{
    AddonDefinition, AddonSelection, Component, ComponentDeployment, ComponentEnvSnapshot,
    ComponentTypeDefinition, MetadataContext, OverrideDocument, Workload,
};
pub use template::TemplateEngineOptions;
