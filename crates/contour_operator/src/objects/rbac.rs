//! Service accounts, roles and bindings for the Contour controller, Envoy and certgen.
//!
//! The ClusterRole and ClusterRoleBinding are shared by name (`contour-<namespace>`)
//! between every Contour of a namespace. Any Contour of that namespace may adopt
//! them, and they are only removed once the last Contour of the namespace goes.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::ResourceExt;
use tracing::{debug, info};

use super::{child_meta, CERTGEN_APP, CONTOUR_APP, ENVOY_APP};
use crate::api::v1alpha1::contour::{Contour, CONTOUR_FINALIZER};
use crate::controllers::ensure::{
    create_or_requeue, delete, ensure, ensure_deleted, recreate, store_error, update_if_changed, ChangedFn,
};
use crate::equality::{
    cluster_role_binding_changed, cluster_role_changed, role_binding_changed, role_changed, role_refs_differ,
    service_account_changed,
};
use crate::store::{object_key, Object, ObjectStore};
use crate::util::errors::{aggregate, Result};
use crate::util::labels::{component_labels, OWNING_CONTOUR_NAMESPACE};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

const READ: &[&str] = &["get", "list", "watch"];
const WRITE_STATUS: &[&str] = &["create", "get", "update"];

fn rbac_labels(contour: &Contour) -> std::collections::BTreeMap<String, String> {
    component_labels(contour, CONTOUR_APP, "rbac")
}

pub fn contour_service_account_name(contour: &Contour) -> String {
    contour.child_name("contour")
}

pub fn envoy_service_account_name(contour: &Contour) -> String {
    contour.child_name("envoy")
}

pub fn certgen_service_account_name(contour: &Contour) -> String {
    contour.child_name("contour-certgen")
}

pub fn certgen_role_name(contour: &Contour) -> String {
    contour.child_name("contour-certgen")
}

pub fn controller_role_name(contour: &Contour) -> String {
    contour.child_name("contour-role")
}

pub fn controller_role_binding_name(contour: &Contour) -> String {
    contour.child_name("contour-rolebinding")
}

pub fn desired_service_accounts(contour: &Contour) -> Vec<ServiceAccount> {
    [
        (contour_service_account_name(contour), CONTOUR_APP),
        (envoy_service_account_name(contour), ENVOY_APP),
        (certgen_service_account_name(contour), CERTGEN_APP),
    ]
    .into_iter()
    .map(|(name, app)| ServiceAccount {
        metadata: child_meta(contour, name, true, component_labels(contour, app, "rbac")),
        ..Default::default()
    })
    .collect()
}

pub fn desired_cluster_role(contour: &Contour) -> ClusterRole {
    ClusterRole {
        metadata: child_meta(contour, contour.cluster_scoped_name(), false, rbac_labels(contour)),
        rules: Some(vec![
            rule("", &["configmaps", "endpoints", "namespaces", "secrets", "services"], READ),
            rule("discovery.k8s.io", &["endpointslices"], READ),
            rule(
                "gateway.networking.k8s.io",
                &[
                    "gatewayclasses",
                    "gateways",
                    "grpcroutes",
                    "httproutes",
                    "referencegrants",
                    "tcproutes",
                    "tlsroutes",
                ],
                READ,
            ),
            rule(
                "gateway.networking.k8s.io",
                &[
                    "gatewayclasses/status",
                    "gateways/status",
                    "grpcroutes/status",
                    "httproutes/status",
                    "tcproutes/status",
                    "tlsroutes/status",
                ],
                &["update"],
            ),
            rule("networking.k8s.io", &["ingresses"], READ),
            rule("networking.k8s.io", &["ingresses/status"], WRITE_STATUS),
            rule(
                "projectcontour.io",
                &[
                    "contourconfigurations",
                    "extensionservices",
                    "httpproxies",
                    "tlscertificatedelegations",
                ],
                READ,
            ),
            rule(
                "projectcontour.io",
                &[
                    "contourconfigurations/status",
                    "extensionservices/status",
                    "httpproxies/status",
                ],
                WRITE_STATUS,
            ),
        ]),
        ..Default::default()
    }
}

fn service_account_subject(contour: &Contour, name: String) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name,
        namespace: contour.namespace(),
        ..Default::default()
    }
}

fn role_ref(kind: &str, name: String) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: kind.to_string(),
        name,
    }
}

pub fn desired_cluster_role_binding(contour: &Contour) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: child_meta(contour, contour.cluster_scoped_name(), false, rbac_labels(contour)),
        role_ref: role_ref("ClusterRole", contour.cluster_scoped_name()),
        subjects: Some(vec![service_account_subject(
            contour,
            contour_service_account_name(contour),
        )]),
    }
}

pub fn desired_certgen_role(contour: &Contour) -> Role {
    Role {
        metadata: child_meta(
            contour,
            certgen_role_name(contour),
            true,
            component_labels(contour, CERTGEN_APP, "rbac"),
        ),
        rules: Some(vec![rule("", &["secrets"], &["create", "update"])]),
    }
}

pub fn desired_certgen_role_binding(contour: &Contour) -> RoleBinding {
    RoleBinding {
        metadata: child_meta(
            contour,
            certgen_role_name(contour),
            true,
            component_labels(contour, CERTGEN_APP, "rbac"),
        ),
        role_ref: role_ref("Role", certgen_role_name(contour)),
        subjects: Some(vec![service_account_subject(
            contour,
            certgen_service_account_name(contour),
        )]),
    }
}

/// Leader election and event recording for the Contour controller.
pub fn desired_controller_role(contour: &Contour) -> Role {
    Role {
        metadata: child_meta(contour, controller_role_name(contour), true, rbac_labels(contour)),
        rules: Some(vec![
            rule("coordination.k8s.io", &["leases"], &["create", "get", "update"]),
            rule("", &["events"], &["create", "get", "update"]),
        ]),
    }
}

pub fn desired_controller_role_binding(contour: &Contour) -> RoleBinding {
    RoleBinding {
        metadata: child_meta(
            contour,
            controller_role_binding_name(contour),
            true,
            rbac_labels(contour),
        ),
        role_ref: role_ref("Role", controller_role_name(contour)),
        subjects: Some(vec![service_account_subject(
            contour,
            contour_service_account_name(contour),
        )]),
    }
}

/// Binding kinds whose role reference cannot change after creation.
trait Binding: Object {
    fn role_ref(&self) -> &RoleRef;
}

impl Binding for RoleBinding {
    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }
}

impl Binding for ClusterRoleBinding {
    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }
}

async fn ensure_binding<S, K>(store: &S, contour: &Contour, desired: K, changed: ChangedFn<K>) -> Result<()>
where
    S: ObjectStore,
    K: Binding,
{
    ensure(store, desired, |current, desired| async move {
        if role_refs_differ(current.role_ref(), desired.role_ref()) {
            return recreate(store, contour, &current, &desired).await;
        }
        update_if_changed(store, contour, current, desired, changed).await
    })
    .await
}

/// The shared cluster-scoped objects belong to whichever Contour of the
/// namespace last reconciled them, so only the namespace label is checked.
fn owned_by_namespace<K: Object>(current: &K, contour: &Contour) -> bool {
    let owned = current.labels().get(OWNING_CONTOUR_NAMESPACE) == contour.namespace().as_ref();
    if !owned {
        info!(
            "{} '{}' is not owned by a Contour in namespace '{}', leaving it untouched",
            K::kind(&()),
            current.name_any(),
            contour.namespace().unwrap_or_default()
        );
    }
    owned
}

/// Replaces a shared object whose immutable fields diverged.
async fn recreate_shared<S, K>(store: &S, contour: &Contour, current: &K, desired: &K) -> Result<()>
where
    S: ObjectStore,
    K: Object,
{
    if !owned_by_namespace(current, contour) {
        return Ok(());
    }
    let name = current.name_any();
    info!("Immutable fields of {} '{}' changed, recreating it", K::kind(&()), name);
    delete::<S, K>(store, None, &name).await?;
    create_or_requeue(store, desired).await
}

/// Updater for the namespace-shared cluster-scoped objects: any Contour of the
/// same namespace may take them over, which rewrites the owner labels.
async fn update_shared<S, K>(store: &S, contour: &Contour, current: K, desired: K, changed: ChangedFn<K>) -> Result<()>
where
    S: ObjectStore,
    K: Object,
{
    let name = current.name_any();
    if !owned_by_namespace(&current, contour) {
        return Ok(());
    }

    match changed(&current, &desired) {
        Some(merged) => {
            store
                .update(&merged)
                .await
                .map_err(|e| store_error::<K>("update", None, &name, e))?;
            info!("Updated {} '{}'", K::kind(&()), object_key(None, &name));
        }
        None => debug!("{} '{}' is up to date", K::kind(&()), name),
    }
    Ok(())
}

/// Ensures every RBAC object of `contour`, stopping at the first failure.
pub async fn ensure_rbac<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    for sa in desired_service_accounts(contour) {
        ensure(store, sa, |current, desired| {
            update_if_changed(store, contour, current, desired, service_account_changed)
        })
        .await?;
    }

    ensure(store, desired_cluster_role(contour), |current, desired| {
        update_shared(store, contour, current, desired, cluster_role_changed)
    })
    .await?;

    ensure(store, desired_cluster_role_binding(contour), |current, desired| async move {
        if role_refs_differ(&current.role_ref, &desired.role_ref) {
            return recreate_shared(store, contour, &current, &desired).await;
        }
        update_shared(store, contour, current, desired, cluster_role_binding_changed).await
    })
    .await?;

    ensure(store, desired_certgen_role(contour), |current, desired| {
        update_if_changed(store, contour, current, desired, role_changed)
    })
    .await?;
    ensure_binding(store, contour, desired_certgen_role_binding(contour), role_binding_changed).await?;

    ensure(store, desired_controller_role(contour), |current, desired| {
        update_if_changed(store, contour, current, desired, role_changed)
    })
    .await?;
    ensure_binding(store, contour, desired_controller_role_binding(contour), role_binding_changed).await
}

/// True when another live Contour in the same namespace still needs the shared
/// cluster-scoped objects. Only Contours holding the finalizer count: one that
/// was never accepted has no cleanup that could remove them later.
async fn namespace_shared<S: ObjectStore>(store: &S, contour: &Contour) -> Result<bool> {
    let namespace = contour.namespace().unwrap_or_default();
    let others = store
        .list::<Contour>(Some(namespace.as_str()))
        .await
        .map_err(|e| store_error::<Contour>("list", None, &namespace, e))?;
    Ok(others
        .iter()
        .any(|other| {
            other.name_any() != contour.name_any()
                && !other.is_deleting()
                && other.finalizers().iter().any(|f| f == CONTOUR_FINALIZER)
        }))
}

/// Deletes the RBAC objects of `contour` in reverse creation order.
pub async fn ensure_rbac_deleted<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    let ns = contour.namespace();
    let ns = ns.as_deref();
    let mut errors = Vec::new();

    let namespaced = [
        ensure_deleted::<S, RoleBinding>(store, ns, &controller_role_binding_name(contour), contour).await,
        ensure_deleted::<S, Role>(store, ns, &controller_role_name(contour), contour).await,
        ensure_deleted::<S, RoleBinding>(store, ns, &certgen_role_name(contour), contour).await,
        ensure_deleted::<S, Role>(store, ns, &certgen_role_name(contour), contour).await,
    ];
    errors.extend(namespaced.into_iter().filter_map(Result::err));

    match namespace_shared(store, contour).await {
        Ok(true) => info!(
            "Keeping ClusterRole and ClusterRoleBinding '{}', still used in namespace '{}'",
            contour.cluster_scoped_name(),
            ns.unwrap_or_default()
        ),
        Ok(false) => {
            let name = contour.cluster_scoped_name();
            for result in [
                ensure_deleted::<S, ClusterRoleBinding>(store, None, &name, contour).await,
                ensure_deleted::<S, ClusterRole>(store, None, &name, contour).await,
            ] {
                errors.extend(result.err());
            }
        }
        Err(e) => errors.push(e),
    }

    for sa in desired_service_accounts(contour).iter().rev() {
        errors.extend(
            ensure_deleted::<S, ServiceAccount>(store, ns, &sa.name_any(), contour)
                .await
                .err(),
        );
    }

    aggregate(errors)
}
