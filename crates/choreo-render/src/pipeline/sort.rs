//! Deterministic output ordering.
//!
//! Resources are sorted by a kind-priority table (dependencies first, e.g.
//! Namespace before the workloads deployed into it), then by namespace and
//! name. The table is a configuration constant; callers with a different
//! deployment model can supply their own via
//! [`EngineOptions`](super::EngineOptions).

use std::collections::HashMap;

use serde_json::Value;

/// Default apply order. Unknown kinds sort after the table, alphabetically
/// by kind, so the total order stays deterministic.
pub(crate) const DEFAULT_KIND_ORDER: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ServiceAccount",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "ConfigMap",
    "Secret",
    "PersistentVolumeClaim",
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "CronJob",
    "Service",
    "Ingress",
    "HTTPRoute",
];

pub(crate) struct KindPriority {
    ranks: HashMap<String, usize>,
}

impl KindPriority {
    pub fn new(order: Option<Vec<String>>) -> Self {
        let ranks = match order {
            Some(order) => order
                .into_iter()
                .enumerate()
                .map(|(rank, kind)| (kind, rank))
                .collect(),
            None => DEFAULT_KIND_ORDER
                .iter()
                .enumerate()
                .map(|(rank, kind)| ((*kind).to_owned(), rank))
                .collect(),
        };
        Self { ranks }
    }

    fn rank(&self, kind: &str) -> usize {
        self.ranks.get(kind).copied().unwrap_or(self.ranks.len())
    }

    pub fn sort(&self, resources: &mut [Value]) {
        resources.sort_by_key(|resource| {
            let kind = string_at(resource, "/kind");
            (
                self.rank(&kind),
                kind,
                string_at(resource, "/metadata/namespace"),
                string_at(resource, "/metadata/name"),
            )
        });
    }
}

fn string_at(resource: &Value, pointer: &str) -> String {
    resource
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn resource(kind: &str, namespace: &str, name: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": kind,
            "metadata": {"name": name, "namespace": namespace},
        })
    }

    #[test]
    fn sorts_by_kind_priority_then_namespace_then_name() {
        let mut resources = vec![
            resource("Service", "a", "svc"),
            resource("Deployment", "b", "app"),
            resource("Deployment", "a", "zapp"),
            resource("Deployment", "a", "app"),
            resource("Namespace", "", "a"),
            resource("ConfigMap", "a", "cm"),
        ];
        KindPriority::new(None).sort(&mut resources);

        let kinds_and_names: Vec<_> = resources
            .iter()
            .map(|resource| {
                (
                    resource["kind"].as_str().unwrap().to_owned(),
                    resource["metadata"]["name"].as_str().unwrap().to_owned(),
                )
            })
            .collect();
        assert_eq!(
            kinds_and_names,
            [
                ("Namespace".to_owned(), "a".to_owned()),
                ("ConfigMap".to_owned(), "cm".to_owned()),
                ("Deployment".to_owned(), "app".to_owned()),
                ("Deployment".to_owned(), "zapp".to_owned()),
                ("Deployment".to_owned(), "app".to_owned()),
                ("Service".to_owned(), "svc".to_owned()),
            ]
        );
    }

    #[test]
    fn unknown_kinds_sort_last_alphabetically() {
        let mut resources = vec![
            resource("Zebra", "ns", "z"),
            resource("Alien", "ns", "a"),
            resource("Service", "ns", "svc"),
        ];
        KindPriority::new(None).sort(&mut resources);

        let kinds: Vec<_> = resources
            .iter()
            .map(|resource| resource["kind"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, ["Service", "Alien", "Zebra"]);
    }

    #[test]
    fn custom_order_replaces_the_table() {
        let mut resources = vec![
            resource("Namespace", "", "ns"),
            resource("Service", "a", "svc"),
        ];
        KindPriority::new(Some(vec!["Service".to_owned(), "Namespace".to_owned()]))
            .sort(&mut resources);
        assert_eq!(resources[0]["kind"], json!("Service"));
    }
}
