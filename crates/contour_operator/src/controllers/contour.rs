//! The ordered sequence of ensure calls that makes up one pass over a Contour.

use kube::ResourceExt;
use tracing::{error, info};

use crate::api::v1alpha1::contour::Contour;
use crate::config::OperatorConfig;
use crate::objects::configmap::{config_hash, desired_configmap, ensure_configmap, ensure_configmap_deleted};
use crate::objects::contour::{ensure_contour_deployment, ensure_contour_deployment_deleted};
use crate::objects::envoy::{ensure_envoy_workload, ensure_envoy_workload_deleted};
use crate::objects::job::{ensure_job, ensure_job_deleted};
use crate::objects::rbac::{ensure_rbac, ensure_rbac_deleted};
use crate::objects::service::{
    ensure_contour_service, ensure_contour_service_deleted, ensure_envoy_service, ensure_envoy_service_deleted,
};
use crate::store::ObjectStore;
use crate::util::errors::{aggregate, Error, Result};

fn collect(errors: &mut Vec<Error>, step: &str, contour: &Contour, result: Result<()>) {
    if let Err(e) = result {
        error!("failed to {} for Contour '{}': {}", step, contour.name_any(), e);
        errors.push(e);
    }
}

/// Ensures every child of `contour`.
///
/// RBAC comes first and a failure there ends the pass, everything after it is
/// attempted and the failures are aggregated.
pub async fn ensure_contour<S: ObjectStore>(store: &S, contour: &Contour, config: &OperatorConfig) -> Result<()> {
    ensure_rbac(store, contour).await.inspect_err(|e| {
        error!("failed to ensure RBAC for Contour '{}': {}", contour.name_any(), e);
    })?;

    let mut errors = Vec::new();

    // The Deployment mounts the rendered config, so it is skipped when rendering fails.
    let hash = match desired_configmap(contour) {
        Ok(configmap) => {
            let hash = config_hash(&configmap);
            collect(&mut errors, "ensure ConfigMap", contour, ensure_configmap(store, contour, configmap).await);
            Some(hash)
        }
        Err(e) => {
            collect(&mut errors, "render configuration", contour, Err(e));
            None
        }
    };

    collect(&mut errors, "ensure certgen Job", contour, ensure_job(store, contour, config).await);

    if let Some(hash) = hash {
        collect(
            &mut errors,
            "ensure Contour Deployment",
            contour,
            ensure_contour_deployment(store, contour, config, &hash).await,
        );
    }

    collect(
        &mut errors,
        "ensure Envoy workload",
        contour,
        ensure_envoy_workload(store, contour, config).await,
    );
    collect(&mut errors, "ensure Contour Service", contour, ensure_contour_service(store, contour).await);
    collect(&mut errors, "ensure Envoy Service", contour, ensure_envoy_service(store, contour).await);

    if errors.is_empty() {
        info!(
            "Ensured all objects of Contour '{}/{}'",
            contour.namespace().unwrap_or_default(),
            contour.name_any()
        );
    }
    aggregate(errors)
}

/// Removes every child of `contour` in reverse creation order.
pub async fn ensure_contour_deleted<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    let mut errors = Vec::new();

    collect(&mut errors, "delete Envoy Service", contour, ensure_envoy_service_deleted(store, contour).await);
    collect(
        &mut errors,
        "delete Contour Service",
        contour,
        ensure_contour_service_deleted(store, contour).await,
    );
    collect(
        &mut errors,
        "delete Envoy workload",
        contour,
        ensure_envoy_workload_deleted(store, contour).await,
    );
    collect(
        &mut errors,
        "delete Contour Deployment",
        contour,
        ensure_contour_deployment_deleted(store, contour).await,
    );
    collect(&mut errors, "delete certgen Job", contour, ensure_job_deleted(store, contour).await);
    collect(&mut errors, "delete ConfigMap", contour, ensure_configmap_deleted(store, contour).await);
    collect(&mut errors, "delete RBAC", contour, ensure_rbac_deleted(store, contour).await);

    if errors.is_empty() {
        info!(
            "Removed all objects of Contour '{}/{}'",
            contour.namespace().unwrap_or_default(),
            contour.name_any()
        );
    }
    aggregate(errors)
}
