//! Built-in kind table.

use tether_core::{Immutable, KindRegistry, KindSpec, MutationPolicy, ResourceKind, Scope};

const SELECTOR: Immutable = Immutable::Field(&["spec", "selector"]);
const SELECTOR_IN_TEMPLATE: Immutable = Immutable::SelectorLabels {
    selector: &["spec", "selector", "matchLabels"],
    template_labels: &["spec", "template", "metadata", "labels"],
};

const DEPLOYMENT: MutationPolicy = MutationPolicy {
    replace: &[
        &["spec", "minReadySeconds"],
        &["spec", "paused"],
        &["spec", "progressDeadlineSeconds"],
        &["spec", "replicas"],
        &["spec", "revisionHistoryLimit"],
        &["spec", "strategy"],
    ],
    immutable: &[SELECTOR, SELECTOR_IN_TEMPLATE],
    pod_template: Some(&["spec", "template"]),
};

const STATEFUL_SET: MutationPolicy = MutationPolicy {
    replace: &[
        &["spec", "minReadySeconds"],
        &["spec", "ordinals"],
        &["spec", "persistentVolumeClaimRetentionPolicy"],
        &["spec", "podManagementPolicy"],
        &["spec", "replicas"],
        &["spec", "revisionHistoryLimit"],
        &["spec", "serviceName"],
        &["spec", "updateStrategy"],
    ],
    immutable: &[
        SELECTOR,
        SELECTOR_IN_TEMPLATE,
        Immutable::ClaimTemplates { path: &["spec", "volumeClaimTemplates"], backfilled: &["volumeMode"] },
    ],
    pod_template: Some(&["spec", "template"]),
};

const SERVICE: MutationPolicy =
    MutationPolicy { replace: &[&["spec", "ports"], &["spec", "selector"]], immutable: &[], pod_template: None };

const CONFIG_MAP: MutationPolicy =
    MutationPolicy { replace: &[&["data"], &["binaryData"]], immutable: &[], pod_template: None };

const SECRET: MutationPolicy = MutationPolicy { replace: &[&["data"]], immutable: &[], pod_template: None };

const WHOLE_SPEC: MutationPolicy = MutationPolicy { replace: &[&["spec"]], immutable: &[], pod_template: None };

const GATEWAY: MutationPolicy = MutationPolicy {
    replace: &[&["spec", "gatewayClassName"], &["spec", "listeners"]],
    immutable: &[],
    pod_template: None,
};

const HTTP_ROUTE: MutationPolicy = MutationPolicy {
    replace: &[&["spec", "parentRefs"], &["spec", "hostnames"], &["spec", "rules"]],
    immutable: &[],
    pod_template: None,
};

const CLUSTER_ROLE: MutationPolicy =
    MutationPolicy { replace: &[&["rules"], &["aggregationRule"]], immutable: &[], pod_template: None };

const CLUSTER_ROLE_BINDING: MutationPolicy = MutationPolicy {
    replace: &[&["subjects"]],
    immutable: &[Immutable::Field(&["roleRef"])],
    pod_template: None,
};

fn entry(group: &str, version: &str, kind: &str, plural: &str, scope: Scope, policy: MutationPolicy) -> KindSpec {
    KindSpec { kind: ResourceKind::new(group, version, kind, plural), scope, workload: false, policy }
}

fn workload(group: &str, version: &str, kind: &str, plural: &str, policy: MutationPolicy) -> KindSpec {
    KindSpec { workload: true, ..entry(group, version, kind, plural, Scope::Namespaced, policy) }
}

/// Every kind the engine knows how to reconcile.
pub fn builtin() -> KindRegistry {
    use Scope::{Cluster, Namespaced};
    KindRegistry::new(vec![
        workload("apps", "v1", "Deployment", "deployments", DEPLOYMENT),
        workload("apps", "v1", "StatefulSet", "statefulsets", STATEFUL_SET),
        entry("", "v1", "Service", "services", Namespaced, SERVICE),
        entry("", "v1", "ConfigMap", "configmaps", Namespaced, CONFIG_MAP),
        entry("", "v1", "Secret", "secrets", Namespaced, SECRET),
        entry("networking.k8s.io", "v1", "Ingress", "ingresses", Namespaced, WHOLE_SPEC),
        entry("gateway.networking.k8s.io", "v1", "Gateway", "gateways", Namespaced, GATEWAY),
        entry("gateway.networking.k8s.io", "v1", "HTTPRoute", "httproutes", Namespaced, HTTP_ROUTE),
        entry("cert-manager.io", "v1", "Certificate", "certificates", Namespaced, WHOLE_SPEC),
        entry("cert-manager.io", "v1", "Issuer", "issuers", Namespaced, WHOLE_SPEC),
        entry("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", Cluster, CLUSTER_ROLE),
        entry("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding", "clusterrolebindings", Cluster, CLUSTER_ROLE_BINDING),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::KindFilter;

    #[test]
    fn table_covers_workloads_and_cluster_kinds() {
        let reg = builtin();
        assert_eq!(reg.len(), 12);
        let workloads: Vec<_> = reg.iter().filter(|s| s.workload).map(|s| s.kind.kind.as_str()).collect();
        assert_eq!(workloads, vec!["Deployment", "StatefulSet"]);
        let cluster: Vec<_> = reg.iter().filter(|s| !s.namespaced()).map(|s| s.kind.kind.as_str()).collect();
        assert_eq!(cluster, vec!["ClusterRole", "ClusterRoleBinding"]);
    }

    #[test]
    fn group_qualified_filter_tells_kinds_apart() {
        let reg = builtin();
        assert_eq!(reg.kinds(&KindFilter::only(["cert-manager.io/Issuer"])).len(), 1);
        assert_eq!(reg.kinds(&KindFilter::exclude(["Secret", "ConfigMap"])).len(), 10);
    }
}
