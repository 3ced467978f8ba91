//! End-to-end renders of complete snapshots through the public [`Engine`]
//! API, from YAML fixtures to the final ordered resource list.

use std::collections::BTreeMap;

use choreo_render::{
    ComponentDeployment, ComponentEnvSnapshot, Engine, EngineOptions, MetadataContext,
    RenderInput, TemplateEngineOptions, pipeline,
};
use indoc::indoc;
use serde_json::{Value, json};

fn metadata() -> MetadataContext {
    MetadataContext {
        name: "reading-list-dev".to_owned(),
        namespace: "dp-default".to_owned(),
        ..MetadataContext::default()
    }
}

fn input(snapshot_yaml: &str, deployment_yaml: Option<&str>) -> RenderInput {
    let snapshot: ComponentEnvSnapshot =
        serde_yaml::from_str(snapshot_yaml).expect("snapshot YAML is valid");
    let deployment: Option<ComponentDeployment> = deployment_yaml
        .map(|yaml| serde_yaml::from_str(yaml).expect("deployment YAML is valid"));
    RenderInput {
        snapshot,
        deployment,
        metadata: metadata(),
        ..RenderInput::default()
    }
}

fn render(snapshot_yaml: &str, deployment_yaml: Option<&str>) -> Vec<Value> {
    Engine::new(EngineOptions::default())
        .render(&input(snapshot_yaml, deployment_yaml))
        .expect("render succeeds")
        .resources
}

const REPLICAS_SNAPSHOT: &str = indoc! {"
    component:
      name: reading-list
      namespace: default
      parameters:
        replicas: 2
    componentType:
      resources:
        - id: deployment
          template:
            apiVersion: apps/v1
            kind: Deployment
            metadata:
              name: ${metadata.name}
              namespace: ${metadata.namespace}
            spec:
              replicas: ${parameters.replicas}
    environment: dev
"};

#[test]
fn simple_render_without_addons() {
    let resources = render(REPLICAS_SNAPSHOT, None);

    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0]["kind"], json!("Deployment"));
    assert_eq!(resources[0]["metadata"]["name"], json!("reading-list-dev"));
    // Whole-match splices keep the JSON type
    assert_eq!(resources[0]["spec"]["replicas"], json!(2));
}

#[test]
fn environment_override_wins_over_component_parameters() {
    let resources = render(
        REPLICAS_SNAPSHOT,
        Some(indoc! {"
            overrides:
              parameters:
                replicas: 5
        "}),
    );

    assert_eq!(resources[0]["spec"]["replicas"], json!(5));
}

const EXPOSE_SNAPSHOT: &str = indoc! {"
    component:
      name: reading-list
      namespace: default
      parameters:
        expose: EXPOSE
    componentType:
      resources:
        - id: deployment
          template:
            apiVersion: apps/v1
            kind: Deployment
            metadata:
              name: ${metadata.name}
        - id: service
          includeWhen: ${parameters.expose}
          template:
            apiVersion: v1
            kind: Service
            metadata:
              name: ${metadata.name}
    environment: dev
"};

#[test]
fn include_when_gates_resources() {
    let exposed = render(&EXPOSE_SNAPSHOT.replace("EXPOSE", "true"), None);
    let kinds: Vec<_> = exposed
        .iter()
        .map(|resource| resource["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, ["Deployment", "Service"]);

    let hidden = render(&EXPOSE_SNAPSHOT.replace("EXPOSE", "false"), None);
    assert_eq!(hidden.len(), 1);
    assert_eq!(hidden[0]["kind"], json!("Deployment"));
}

#[test]
fn for_each_expands_one_resource_per_item() {
    let resources = render(
        indoc! {"
            component:
              name: reading-list
              namespace: default
              parameters:
                secrets: [s1, s2]
            componentType:
              resources:
                - id: secrets
                  forEach:
                    expr: ${parameters.secrets}
                    var: secret
                  template:
                    apiVersion: v1
                    kind: Secret
                    metadata:
                      name: ${secret}
            environment: dev
        "},
        None,
    );

    let names: Vec<_> = resources
        .iter()
        .map(|resource| resource["metadata"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["s1", "s2"]);
}

#[test]
fn addon_creates_additional_resources() {
    let resources = render(
        indoc! {"
            component:
              name: reading-list
              namespace: default
              addons:
                - name: mysql
                  instanceName: db-1
                  parameters:
                    database: mydb
            componentType:
              resources:
                - id: deployment
                  template:
                    apiVersion: apps/v1
                    kind: Deployment
                    metadata:
                      name: ${metadata.name}
            addons:
              mysql:
                name: mysql
                creates:
                  - id: credentials
                    template:
                      apiVersion: v1
                      kind: Secret
                      metadata:
                        name: ${addon.instanceName}-secret
                      data:
                        database: ${parameters.database}
            environment: dev
        "},
        None,
    );

    // Secrets sort before Deployments
    assert_eq!(resources.len(), 2);
    assert_eq!(resources[0]["kind"], json!("Secret"));
    assert_eq!(resources[0]["metadata"]["name"], json!("db-1-secret"));
    assert_eq!(resources[0]["data"], json!({"database": "mydb"}));
    assert_eq!(resources[1]["kind"], json!("Deployment"));
}

const PATCH_SNAPSHOT: &str = indoc! {"
    component:
      name: reading-list
      namespace: default
      addons:
        - name: env-injector
          instanceName: inject-1
    componentType:
      resources:
        - id: deployment
          template:
            apiVersion: apps/v1
            kind: Deployment
            metadata:
              name: ${metadata.name}
            spec:
              template:
                spec:
                  containers:
                    - name: app
                      image: app:v1
                      env:
                        - name: A
                          value: '1'
    addons:
      env-injector:
        name: env-injector
        patches:
          - target:
              apiVersion: apps/v1
              kind: Deployment
            operations:
              - op: add
                path: /spec/template/spec/containers/[?(@.name=='app')]/env/-
                value:
                  name: B
                  value: '2'
    environment: dev
"};

#[test]
fn addon_patch_appends_through_array_filter() {
    let resources = render(PATCH_SNAPSHOT, None);

    assert_eq!(resources.len(), 1);
    let env = &resources[0]["spec"]["template"]["spec"]["containers"][0]["env"];
    assert_eq!(
        env,
        &json!([
            {"name": "A", "value": "1"},
            {"name": "B", "value": "2"},
        ])
    );
}

#[test]
fn patch_matching_no_resources_leaves_output_unchanged() {
    let patched_elsewhere =
        PATCH_SNAPSHOT.replace("\n          kind: Deployment", "\n          kind: StatefulSet");
    let resources = render(&patched_elsewhere, None);

    let env = &resources[0]["spec"]["template"]["spec"]["containers"][0]["env"];
    assert_eq!(env, &json!([{"name": "A", "value": "1"}]));
}

#[test]
fn where_filter_narrows_patch_targets() {
    let resources = render(
        indoc! {"
            component:
              name: reading-list
              namespace: default
              addons:
                - name: labeler
                  instanceName: label-1
            componentType:
              resources:
                - id: first
                  template:
                    apiVersion: v1
                    kind: ConfigMap
                    metadata:
                      name: cm-app
                - id: second
                  template:
                    apiVersion: v1
                    kind: ConfigMap
                    metadata:
                      name: cm-other
            addons:
              labeler:
                name: labeler
                patches:
                  - target:
                      apiVersion: v1
                      kind: ConfigMap
                      where: ${resource.metadata.name == 'cm-app'}
                    operations:
                      - op: add
                        path: /data
                        value:
                          touched: 'yes'
            environment: dev
        "},
        None,
    );

    assert_eq!(resources[0]["metadata"]["name"], json!("cm-app"));
    assert_eq!(resources[0]["data"], json!({"touched": "yes"}));
    assert_eq!(resources[1].get("data"), None);
}

#[test]
fn missing_data_skips_gates_expansions_and_patch_candidates() {
    let resources = render(
        indoc! {"
            component:
              name: reading-list
              namespace: default
              addons:
                - name: annotator
                  instanceName: note-1
            componentType:
              resources:
                - id: deployment
                  template:
                    apiVersion: apps/v1
                    kind: Deployment
                    metadata:
                      name: ${metadata.name}
                - id: service
                  includeWhen: ${parameters.expose}
                  template:
                    apiVersion: v1
                    kind: Service
                    metadata:
                      name: ${metadata.name}
                - id: secrets
                  forEach:
                    expr: ${parameters.secrets}
                    var: secret
                  template:
                    apiVersion: v1
                    kind: Secret
                    metadata:
                      name: ${secret}
            addons:
              annotator:
                name: annotator
                patches:
                  - target:
                      apiVersion: apps/v1
                      kind: Deployment
                      where: ${resource.metadata.labels.tier == 'web'}
                    operations:
                      - op: add
                        path: /metadata/annotations
                        value:
                          patched: 'yes'
            environment: dev
        "},
        None,
    );

    // `parameters.expose` and `parameters.secrets` are absent: the Service
    // is skipped and the forEach expands to nothing. The `where` filter hits
    // an absent labels key, so the Deployment is excluded from the patch.
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0]["kind"], json!("Deployment"));
    assert_eq!(resources[0]["metadata"].get("annotations"), None);
}

#[test]
fn two_renders_produce_identical_output() {
    let engine = Engine::new(EngineOptions::default());
    let input = input(PATCH_SNAPSHOT, None);

    let first = engine.render(&input).unwrap();
    let second = engine.render(&input).unwrap();
    assert_eq!(first, second);
}

#[test]
fn disabling_caches_does_not_change_output() {
    let cached = render(PATCH_SNAPSHOT, None);

    let uncached = Engine::new(EngineOptions {
        template: TemplateEngineOptions {
            disable_caching: true,
            ..TemplateEngineOptions::default()
        },
        ..EngineOptions::default()
    })
    .render(&input(PATCH_SNAPSHOT, None))
    .unwrap()
    .resources;

    assert_eq!(cached, uncached);
}

#[test]
fn common_labels_never_overwrite_template_labels() {
    let mut input = input(
        indoc! {"
            component:
              name: reading-list
              namespace: default
            componentType:
              resources:
                - id: deployment
                  template:
                    apiVersion: apps/v1
                    kind: Deployment
                    metadata:
                      name: ${metadata.name}
                      labels:
                        owner: template
            environment: dev
        "},
        None,
    );
    input.resource_labels = BTreeMap::from([
        ("owner".to_owned(), "engine".to_owned()),
        ("environment".to_owned(), "dev".to_owned()),
    ]);

    let resources = Engine::new(EngineOptions::default())
        .render(&input)
        .unwrap()
        .resources;
    assert_eq!(
        resources[0]["metadata"]["labels"],
        json!({"owner": "template", "environment": "dev"})
    );
}

#[test]
fn resources_missing_identity_fields_fail_validation() {
    let err = Engine::new(EngineOptions::default())
        .render(&input(
            indoc! {"
                component:
                  name: reading-list
                  namespace: default
                componentType:
                  resources:
                    - id: nameless
                      template:
                        apiVersion: v1
                        kind: ConfigMap
                        metadata: {}
                environment: dev
            "},
            None,
        ))
        .unwrap_err();

    assert!(matches!(
        err,
        pipeline::Error::InvalidResource {
            field: "metadata.name",
            ..
        }
    ));
}

#[test]
fn output_is_sorted_by_kind_priority() {
    let resources = render(
        indoc! {"
            component:
              name: reading-list
              namespace: default
            componentType:
              resources:
                - id: service
                  template:
                    apiVersion: v1
                    kind: Service
                    metadata:
                      name: svc
                - id: deployment
                  template:
                    apiVersion: apps/v1
                    kind: Deployment
                    metadata:
                      name: app
                - id: config
                  template:
                    apiVersion: v1
                    kind: ConfigMap
                    metadata:
                      name: cm
            environment: dev
        "},
        None,
    );

    let kinds: Vec<_> = resources
        .iter()
        .map(|resource| resource["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, ["ConfigMap", "Deployment", "Service"]);
}
