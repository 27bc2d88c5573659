//! The certgen Job that writes the `contourcert` and `envoycert` secrets.
//!
//! Job specs are immutable, so drift is handled by deleting the Job and
//! creating it again once the old one is gone.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info};

use super::{
    child_meta, field_env, non_root_security_context, placement, rbac::certgen_service_account_name,
    with_server_defaults, CERTGEN_APP,
};
use crate::api::v1alpha1::contour::Contour;
use crate::config::OperatorConfig;
use crate::controllers::ensure::{delete, ensure, ensure_deleted, store_error, store_failure};
use crate::equality::job_changed;
use crate::store::{is_already_exists, object_key, ObjectStore};
use crate::util::errors::{Error, Result};
use crate::util::labels::{component_labels, is_owned_by};

pub fn job_name(contour: &Contour) -> String {
    contour.child_name("contour-certgen")
}

pub fn desired_job(contour: &Contour, config: &OperatorConfig) -> Job {
    let labels = component_labels(contour, CERTGEN_APP, "certgen");
    let (node_selector, tolerations) = placement(contour.contour_placement());

    let container = with_server_defaults(Container {
        name: "contour".to_string(),
        image: Some(config.contour_image.clone()),
        command: Some(
            [
                "contour",
                "certgen",
                "--kube",
                "--incluster",
                "--overwrite",
                "--secrets-format=compact",
                "--namespace=$(CONTOUR_NAMESPACE)",
            ]
            .map(String::from)
            .to_vec(),
        ),
        env: Some(vec![field_env("CONTOUR_NAMESPACE", "metadata.namespace")]),
        ..Default::default()
    });

    Job {
        metadata: child_meta(contour, job_name(contour), true, labels.clone()),
        spec: Some(JobSpec {
            backoff_limit: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(certgen_service_account_name(contour)),
                    security_context: Some(non_root_security_context()),
                    node_selector,
                    tolerations,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Creates `desired`, polling every `interval` while the previous Job is still
/// terminating. Gives up after `timeout` with a retryable error.
async fn create_with_retry<S: ObjectStore>(
    store: &S,
    desired: &Job,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let namespace = desired.namespace();
    let name = desired.name_any();
    let deadline = Instant::now() + timeout;

    loop {
        match store.create(desired).await {
            Ok(_) => {
                info!("Created Job '{}'", object_key(namespace.as_deref(), &name));
                return Ok(());
            }
            Err(e) if is_already_exists(&e) => {
                if Instant::now() + interval > deadline {
                    return Err(Error::requeue(
                        store_failure::<Job>("create", namespace.as_deref(), &name, e),
                        timeout,
                    ));
                }
                debug!(
                    "Job '{}' is still terminating, retrying in {:?}",
                    object_key(namespace.as_deref(), &name),
                    interval
                );
                sleep(interval).await;
            }
            Err(e) => return Err(store_error::<Job>("create", namespace.as_deref(), &name, e)),
        }
    }
}

pub async fn ensure_job<S: ObjectStore>(store: &S, contour: &Contour, config: &OperatorConfig) -> Result<()> {
    ensure(store, desired_job(contour, config), |current, desired| async move {
        let key = object_key(current.namespace().as_deref(), &current.name_any());
        if !is_owned_by(&current, contour) {
            info!("Job '{}' is not owned by Contour '{}', leaving it untouched", key, contour.name_any());
            return Ok(());
        }
        if job_changed(&current, &desired).is_none() {
            debug!("Job '{}' is up to date", key);
            return Ok(());
        }

        info!("Job '{}' changed, recreating it", key);
        delete::<S, Job>(store, current.namespace().as_deref(), &current.name_any()).await?;
        create_with_retry(store, &desired, config.job_poll_interval, config.job_poll_timeout).await
    })
    .await
}

pub async fn ensure_job_deleted<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    ensure_deleted::<S, Job>(store, contour.namespace().as_deref(), &job_name(contour), contour).await
}
