//! Owner and workload labels stamped on every object created for a `Contour`.
//!
//! The owner labels are the only link between a `Contour` and its children: no
//! owner references or cached graphs are consulted when deciding whether an
//! object may be updated or deleted.

use std::collections::BTreeMap;

use kube::{Resource, ResourceExt};

use crate::api::v1alpha1::contour::Contour;

/// Name of the `Contour` that owns the labelled object.
pub const OWNING_CONTOUR_NAME: &str = "contour.operator.projectcontour.io/owning-contour-name";

/// Namespace of the `Contour` that owns the labelled object.
pub const OWNING_CONTOUR_NAMESPACE: &str = "contour.operator.projectcontour.io/owning-contour-namespace";

pub const K8S_NAME: &str = "app.kubernetes.io/name";
pub const K8S_INSTANCE: &str = "app.kubernetes.io/instance";
pub const K8S_COMPONENT: &str = "app.kubernetes.io/component";
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub const MANAGED_BY_OPERATOR: &str = "contour-operator";

/// SHA-256 of the rendered Contour configuration, stamped on the Contour pod template.
pub const CONFIG_HASH_ANNOTATION: &str = "contour.operator.projectcontour.io/config-hash";

pub const AWS_LB_BACKEND_PROTOCOL: &str = "service.beta.kubernetes.io/aws-load-balancer-backend-protocol";
pub const AWS_LB_TYPE: &str = "service.beta.kubernetes.io/aws-load-balancer-type";
pub const AWS_LB_PROXY_PROTOCOL: &str = "service.beta.kubernetes.io/aws-load-balancer-proxy-protocol";
pub const AWS_LB_INTERNAL: &str = "service.beta.kubernetes.io/aws-load-balancer-internal";
pub const AZURE_LB_INTERNAL: &str = "service.beta.kubernetes.io/azure-load-balancer-internal";
pub const AZURE_LB_INTERNAL_SUBNET: &str = "service.beta.kubernetes.io/azure-load-balancer-internal-subnet";
pub const GCP_LB_TYPE: &str = "networking.gke.io/load-balancer-type";
pub const GCP_LB_SUBNET: &str = "networking.gke.io/internal-load-balancer-subnet";

/// Every cloud provider annotation the operator may set on the Envoy service.
/// Keys absent from the desired service are removed from the live one.
pub const LOAD_BALANCER_ANNOTATIONS: [&str; 8] = [
    AWS_LB_BACKEND_PROTOCOL,
    AWS_LB_TYPE,
    AWS_LB_PROXY_PROTOCOL,
    AWS_LB_INTERNAL,
    AZURE_LB_INTERNAL,
    AZURE_LB_INTERNAL_SUBNET,
    GCP_LB_TYPE,
    GCP_LB_SUBNET,
];

/// Label set identifying `contour` as the owner of an object.
pub fn owner_labels(contour: &Contour) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNING_CONTOUR_NAME.to_string(), contour.name_any()),
        (
            OWNING_CONTOUR_NAMESPACE.to_string(),
            contour.namespace().unwrap_or_default(),
        ),
    ])
}

/// True when every pair of `labels` is present on `obj` with the same value.
/// Extra labels on the object are ignored.
pub fn labels_exist<K: Resource>(obj: &K, labels: &BTreeMap<String, String>) -> bool {
    let current = obj.labels();
    labels.iter().all(|(k, v)| current.get(k) == Some(v))
}

/// True when `obj` carries the owner labels of `contour`.
pub fn is_owned_by<K: Resource>(obj: &K, contour: &Contour) -> bool {
    labels_exist(obj, &owner_labels(contour))
}

/// Owner labels plus the standard `app.kubernetes.io` set for one component.
pub fn component_labels(contour: &Contour, app: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = owner_labels(contour);
    labels.extend(selector_labels(contour, app));
    labels.insert(K8S_COMPONENT.to_string(), component.to_string());
    labels.insert(K8S_MANAGED_BY.to_string(), MANAGED_BY_OPERATOR.to_string());
    labels
}

/// Pod selector of a Contour or Envoy workload.
pub fn selector_labels(contour: &Contour, app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (K8S_NAME.to_string(), app.to_string()),
        (K8S_INSTANCE.to_string(), contour.name_any()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::contour::ContourSpec;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn contour(name: &str, ns: &str) -> Contour {
        let mut c = Contour::new(name, ContourSpec::default());
        c.metadata.namespace = Some(ns.to_string());
        c
    }

    fn configmap(labels: Option<BTreeMap<String, String>>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".to_string()),
                labels,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn owner_labels_are_stable() {
        let c = contour("demo", "ns1");
        assert_eq!(owner_labels(&c), owner_labels(&c.clone()));
        assert_eq!(owner_labels(&c)[OWNING_CONTOUR_NAME], "demo");
        assert_eq!(owner_labels(&c)[OWNING_CONTOUR_NAMESPACE], "ns1");
    }

    #[test]
    fn extra_labels_on_the_object_are_ignored() {
        let c = contour("demo", "ns1");
        let mut labels = owner_labels(&c);
        labels.insert("team".to_string(), "edge".to_string());
        assert!(labels_exist(&configmap(Some(labels)), &owner_labels(&c)));
    }

    #[test]
    fn missing_or_different_labels_mean_not_owned() {
        let c = contour("demo", "ns1");
        assert!(!labels_exist(&configmap(None), &owner_labels(&c)));

        let other = owner_labels(&contour("other", "ns1"));
        assert!(!is_owned_by(&configmap(Some(other)), &c));
    }

    #[test]
    fn empty_label_set_matches_anything() {
        assert!(labels_exist(&configmap(None), &BTreeMap::new()));
    }
}
