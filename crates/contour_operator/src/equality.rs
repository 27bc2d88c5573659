//! Managed-field comparison for every kind the operator writes.
//!
//! Each `*_changed(current, desired)` function starts from a clone of `current`,
//! copies over the fields the operator owns and returns the merged object when
//! any of them differed. Everything else on the live object (resource version,
//! uid, status, server defaults, labels and annotations set by others) is kept
//! as is, so the merged object can be submitted as an update.
//!
//! Comparisons are semantic: `None` equals an empty collection, label and
//! annotation maps are compared as "desired pairs are present", and optional
//! scalars the desired object leaves unset are not owned.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PodTemplateSpec, Service, ServiceAccount, ServicePort, ServiceSpec};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding, RoleRef};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::Resource;

use crate::util::labels::LOAD_BALANCER_ANNOTATIONS;

type StringMap = Option<BTreeMap<String, String>>;

/// `None` and the default value are the same thing.
fn semantic_eq<T: PartialEq + Default>(a: &Option<T>, b: &Option<T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (None, None) => true,
        (Some(v), None) | (None, Some(v)) => *v == T::default(),
    }
}

fn sync<T: PartialEq + Clone>(current: &mut T, desired: &T) -> bool {
    if current != desired {
        *current = desired.clone();
        return true;
    }
    false
}

fn sync_semantic<T: PartialEq + Clone + Default>(current: &mut Option<T>, desired: &Option<T>) -> bool {
    if !semantic_eq(current, desired) {
        *current = desired.clone();
        return true;
    }
    false
}

/// Optional fields the desired object leaves unset belong to someone else.
fn sync_if_set<T: PartialEq + Clone>(current: &mut Option<T>, desired: &Option<T>) -> bool {
    match desired {
        Some(_) if current != desired => {
            *current = desired.clone();
            true
        }
        _ => false,
    }
}

/// Adds the desired pairs to `current`, leaving foreign keys alone.
fn sync_map(current: &mut StringMap, desired: &StringMap) -> bool {
    let Some(desired) = desired else { return false };
    let target = current.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (k, v) in desired {
        if target.get(k) != Some(v) {
            target.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

fn sync_labels<K: Resource>(merged: &mut K, desired: &K) -> bool {
    sync_map(&mut merged.meta_mut().labels, &desired.meta().labels)
}

/// Labels, annotations and the pod spec fields the operator sets on workloads and jobs.
fn sync_pod_template(merged: &mut PodTemplateSpec, desired: &PodTemplateSpec) -> bool {
    let mut changed = false;

    if let Some(desired_meta) = desired.metadata.as_ref() {
        let meta = merged.metadata.get_or_insert_with(ObjectMeta::default);
        changed |= sync_map(&mut meta.labels, &desired_meta.labels);
        changed |= sync_map(&mut meta.annotations, &desired_meta.annotations);
    }

    let Some(ds) = desired.spec.as_ref() else {
        return changed;
    };
    let spec = merged.spec.get_or_insert_with(Default::default);
    changed |= sync(&mut spec.containers, &ds.containers);
    changed |= sync_semantic(&mut spec.init_containers, &ds.init_containers);
    changed |= sync_semantic(&mut spec.volumes, &ds.volumes);
    changed |= sync_if_set(&mut spec.service_account_name, &ds.service_account_name);
    changed |= sync_semantic(&mut spec.node_selector, &ds.node_selector);
    changed |= sync_semantic(&mut spec.tolerations, &ds.tolerations);
    changed |= sync_semantic(&mut spec.security_context, &ds.security_context);
    changed |= sync_if_set(&mut spec.restart_policy, &ds.restart_policy);
    changed |= sync_if_set(
        &mut spec.termination_grace_period_seconds,
        &ds.termination_grace_period_seconds,
    );
    changed
}

fn selectors_differ(current: &LabelSelector, desired: &LabelSelector) -> bool {
    !semantic_eq(&current.match_labels, &desired.match_labels)
        || !semantic_eq(&current.match_expressions, &desired.match_expressions)
}

/// The pod selector of a Deployment is immutable; a mismatch means delete and recreate.
pub fn deployment_selectors_differ(current: &Deployment, desired: &Deployment) -> bool {
    match (current.spec.as_ref(), desired.spec.as_ref()) {
        (Some(c), Some(d)) => selectors_differ(&c.selector, &d.selector),
        (None, None) => false,
        _ => true,
    }
}

/// The pod selector of a DaemonSet is immutable; a mismatch means delete and recreate.
pub fn daemonset_selectors_differ(current: &DaemonSet, desired: &DaemonSet) -> bool {
    match (current.spec.as_ref(), desired.spec.as_ref()) {
        (Some(c), Some(d)) => selectors_differ(&c.selector, &d.selector),
        (None, None) => false,
        _ => true,
    }
}

pub fn deployment_changed(current: &Deployment, desired: &Deployment) -> Option<Deployment> {
    let mut merged = current.clone();
    let mut changed = sync_labels(&mut merged, desired);

    if let Some(ds) = desired.spec.as_ref() {
        let spec = merged.spec.get_or_insert_with(Default::default);
        changed |= sync_if_set(&mut spec.replicas, &ds.replicas);
        changed |= sync_if_set(&mut spec.strategy, &ds.strategy);
        changed |= sync_pod_template(&mut spec.template, &ds.template);
    }

    changed.then_some(merged)
}

pub fn daemonset_changed(current: &DaemonSet, desired: &DaemonSet) -> Option<DaemonSet> {
    let mut merged = current.clone();
    let mut changed = sync_labels(&mut merged, desired);

    if let Some(ds) = desired.spec.as_ref() {
        let spec = merged.spec.get_or_insert_with(Default::default);
        changed |= sync_if_set(&mut spec.update_strategy, &ds.update_strategy);
        changed |= sync_pod_template(&mut spec.template, &ds.template);
    }

    changed.then_some(merged)
}

/// Job specs are immutable once created, so callers recreate rather than update
/// when this reports a change. Template labels are compared as a subset because
/// the API server adds its own controller labels.
pub fn job_changed(current: &Job, desired: &Job) -> Option<Job> {
    let mut merged = current.clone();
    let mut changed = sync_labels(&mut merged, desired);

    if let Some(ds) = desired.spec.as_ref() {
        let spec = merged.spec.get_or_insert_with(Default::default);
        changed |= sync_if_set(&mut spec.backoff_limit, &ds.backoff_limit);
        changed |= sync_pod_template(&mut spec.template, &ds.template);
    }

    changed.then_some(merged)
}

pub fn configmap_changed(current: &ConfigMap, desired: &ConfigMap) -> Option<ConfigMap> {
    let mut merged = current.clone();
    let mut changed = sync_labels(&mut merged, desired);
    changed |= sync_semantic(&mut merged.data, &desired.data);
    changed.then_some(merged)
}

pub fn service_account_changed(current: &ServiceAccount, desired: &ServiceAccount) -> Option<ServiceAccount> {
    let mut merged = current.clone();
    sync_labels(&mut merged, desired).then_some(merged)
}

pub fn cluster_role_changed(current: &ClusterRole, desired: &ClusterRole) -> Option<ClusterRole> {
    let mut merged = current.clone();
    let mut changed = sync_labels(&mut merged, desired);
    changed |= sync_semantic(&mut merged.rules, &desired.rules);
    changed.then_some(merged)
}

pub fn role_changed(current: &Role, desired: &Role) -> Option<Role> {
    let mut merged = current.clone();
    let mut changed = sync_labels(&mut merged, desired);
    changed |= sync_semantic(&mut merged.rules, &desired.rules);
    changed.then_some(merged)
}

pub fn cluster_role_binding_changed(
    current: &ClusterRoleBinding,
    desired: &ClusterRoleBinding,
) -> Option<ClusterRoleBinding> {
    let mut merged = current.clone();
    let mut changed = sync_labels(&mut merged, desired);
    changed |= sync_semantic(&mut merged.subjects, &desired.subjects);
    changed.then_some(merged)
}

pub fn role_binding_changed(current: &RoleBinding, desired: &RoleBinding) -> Option<RoleBinding> {
    let mut merged = current.clone();
    let mut changed = sync_labels(&mut merged, desired);
    changed |= sync_semantic(&mut merged.subjects, &desired.subjects);
    changed.then_some(merged)
}

/// Role references of bindings are immutable.
pub fn role_refs_differ(current: &RoleRef, desired: &RoleRef) -> bool {
    current != desired
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum NodePorts {
    /// ClusterIP services carry no node ports.
    Drop,
    /// Explicit desired numbers win, otherwise the server-assigned number stays.
    PreferDesired,
}

/// Desired ports, with node port numbers resolved against the live service.
fn resolve_ports(current: &ServiceSpec, desired: &ServiceSpec, node_ports: NodePorts) -> Option<Vec<ServicePort>> {
    let live = current.ports.as_deref().unwrap_or_default();
    desired.ports.as_ref().map(|ports| {
        ports
            .iter()
            .map(|port| {
                let mut port = port.clone();
                match node_ports {
                    NodePorts::Drop => port.node_port = None,
                    NodePorts::PreferDesired => {
                        if port.node_port.is_none() {
                            port.node_port = live.iter().find(|p| p.name == port.name).and_then(|p| p.node_port);
                        }
                    }
                }
                port
            })
            .collect()
    })
}

/// Fields owned by every service variant. The cluster IP is never touched.
fn sync_service(merged: &mut Service, desired: &Service, node_ports: NodePorts) -> bool {
    let mut changed = sync_labels(merged, desired);

    {
        let meta = &mut merged.metadata;
        changed |= sync_map(&mut meta.annotations, &desired.metadata.annotations);
        let wanted = desired.metadata.annotations.clone().unwrap_or_default();
        if let Some(annotations) = meta.annotations.as_mut() {
            for key in LOAD_BALANCER_ANNOTATIONS {
                if !wanted.contains_key(key) && annotations.remove(key).is_some() {
                    changed = true;
                }
            }
        }
    }

    let Some(ds) = desired.spec.as_ref() else {
        return changed;
    };
    let spec = merged.spec.get_or_insert_with(Default::default);
    let ports = resolve_ports(spec, ds, node_ports);
    changed |= sync_semantic(&mut spec.ports, &ports);
    changed |= sync_semantic(&mut spec.selector, &ds.selector);
    changed |= sync_if_set(&mut spec.session_affinity, &ds.session_affinity);
    changed |= sync_if_set(&mut spec.type_, &ds.type_);
    changed
}

pub fn cluster_ip_service_changed(current: &Service, desired: &Service) -> Option<Service> {
    let mut merged = current.clone();
    let mut changed = sync_service(&mut merged, desired, NodePorts::Drop);

    // Leftovers from a previous NodePort or LoadBalancer incarnation.
    if let Some(spec) = merged.spec.as_mut() {
        for stale in [
            spec.load_balancer_ip.take().is_some(),
            spec.external_traffic_policy.take().is_some(),
            spec.health_check_node_port.take().is_some(),
            spec.allocate_load_balancer_node_ports.take().is_some(),
        ] {
            changed |= stale;
        }
    }

    changed.then_some(merged)
}

pub fn node_port_service_changed(current: &Service, desired: &Service) -> Option<Service> {
    let mut merged = current.clone();
    let mut changed = sync_service(&mut merged, desired, NodePorts::PreferDesired);

    if let (Some(spec), Some(ds)) = (merged.spec.as_mut(), desired.spec.as_ref()) {
        changed |= sync_if_set(&mut spec.external_traffic_policy, &ds.external_traffic_policy);
        changed |= spec.load_balancer_ip.take().is_some();
    }

    changed.then_some(merged)
}

pub fn load_balancer_service_changed(current: &Service, desired: &Service) -> Option<Service> {
    let mut merged = current.clone();
    let mut changed = sync_service(&mut merged, desired, NodePorts::PreferDesired);

    if let (Some(spec), Some(ds)) = (merged.spec.as_mut(), desired.spec.as_ref()) {
        changed |= sync_if_set(&mut spec.external_traffic_policy, &ds.external_traffic_policy);
        changed |= sync(&mut spec.load_balancer_ip, &ds.load_balancer_ip);
    }

    changed.then_some(merged)
}
