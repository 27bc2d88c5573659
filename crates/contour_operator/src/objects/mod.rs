//! Desired state for every object a `Contour` owns, plus the per-kind ensure wrappers.
//!
//! Builders are pure functions of the `Contour` and the operator configuration.
//! They spell out the fields the API server would otherwise default so that a
//! freshly read object compares equal to a freshly built one.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSecurityContext, Probe, ResourceRequirements,
    Toleration,
};
use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::api::v1alpha1::contour::{Contour, WorkloadPlacement};

pub mod configmap;
pub mod contour;
pub mod envoy;
pub mod job;
pub mod rbac;
pub mod service;

pub const CONTOUR_APP: &str = "contour";
pub const ENVOY_APP: &str = "envoy";
pub const CERTGEN_APP: &str = "contour-certgen";

/// Secrets written by the certgen Job and mounted by the workloads.
pub const CONTOUR_CERT_SECRET: &str = "contourcert";
pub const ENVOY_CERT_SECRET: &str = "envoycert";

pub const XDS_PORT: i32 = 8001;
pub const CONTOUR_METRICS_PORT: i32 = 8000;
pub const CONTOUR_DEBUG_PORT: i32 = 6060;
pub const ENVOY_METRICS_PORT: i32 = 8002;
pub const ENVOY_SHUTDOWN_PORT: i32 = 8090;

/// Unprivileged uid/gid the Contour binaries run as.
const NOBODY: i64 = 65534;

/// Metadata of a child object. Cluster-scoped children get no namespace.
pub(crate) fn child_meta(contour: &Contour, name: String, namespaced: bool, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: if namespaced { contour.namespace() } else { None },
        labels: Some(labels),
        ..Default::default()
    }
}

pub(crate) fn string_map<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Exposes a pod field to the container as an environment variable.
pub(crate) fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn probe_defaults(probe: &mut Probe) {
    probe.timeout_seconds.get_or_insert(1);
    probe.period_seconds.get_or_insert(10);
    probe.success_threshold.get_or_insert(1);
    probe.failure_threshold.get_or_insert(3);
    if let Some(http) = probe.http_get.as_mut() {
        http.scheme.get_or_insert_with(|| "HTTP".to_string());
    }
}

/// Fills in what the API server defaults on a container.
pub(crate) fn with_server_defaults(mut container: Container) -> Container {
    container
        .image_pull_policy
        .get_or_insert_with(|| "IfNotPresent".to_string());
    container
        .termination_message_path
        .get_or_insert_with(|| "/dev/termination-log".to_string());
    container
        .termination_message_policy
        .get_or_insert_with(|| "File".to_string());
    container.resources.get_or_insert_with(ResourceRequirements::default);
    for port in container.ports.iter_mut().flatten() {
        port.protocol.get_or_insert_with(|| "TCP".to_string());
    }
    for probe in [container.liveness_probe.as_mut(), container.readiness_probe.as_mut()]
        .into_iter()
        .flatten()
    {
        probe_defaults(probe);
    }
    if let Some(lifecycle) = container.lifecycle.as_mut() {
        if let Some(http) = lifecycle.pre_stop.as_mut().and_then(|h| h.http_get.as_mut()) {
            http.scheme.get_or_insert_with(|| "HTTP".to_string());
        }
    }
    container
}

pub(crate) fn non_root_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(NOBODY),
        run_as_group: Some(NOBODY),
        ..Default::default()
    }
}

/// Node selector and tolerations of one workload.
pub(crate) fn placement(
    placement: Option<&WorkloadPlacement>,
) -> (Option<BTreeMap<String, String>>, Option<Vec<Toleration>>) {
    match placement {
        Some(p) => (p.node_selector.clone(), p.tolerations.clone()),
        None => (None, None),
    }
}
