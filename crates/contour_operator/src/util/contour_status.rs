//! The `Available` condition and replica counts written to `Contour.status`.

use chrono::Utc;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::api::v1alpha1::contour::{Contour, ContourStatus, WorkloadType};
use crate::objects::contour::contour_deployment_name;
use crate::objects::envoy::envoy_workload_name;
use crate::store::{is_not_found, Object, ObjectStore};
use crate::util::errors::{Error, Result, StdError};

pub const AVAILABLE_CONDITION: &str = "Available";

pub const STATUS_FIELD_MANAGER: &str = "contour-operator-status-manager";

pub const REASON_AVAILABLE: &str = "ContourAvailable";
pub const REASON_UNAVAILABLE: &str = "ContourUnavailable";
pub const REASON_FAILED: &str = "ReconcileFailed";

/// Sets the corresponding condition in conditions to new_condition and returns
/// a tuple containing the new conditions vector and whether it was changed.
///
/// LastTransitionTime only moves when the status flips or the condition is new.
pub fn set_status_condition(conditions: &[Condition], mut new_condition: Condition) -> (Vec<Condition>, bool) {
    let mut new_conditions = Vec::from(conditions);
    let mut changed = false;

    if let Some(existing) = new_conditions.iter_mut().find(|c| c.type_ == new_condition.type_) {
        if existing.status != new_condition.status {
            existing.status = new_condition.status;
            existing.last_transition_time = Time(Utc::now());
            changed = true;
        }
        if existing.reason != new_condition.reason {
            existing.reason = new_condition.reason;
            changed = true;
        }
        if existing.message != new_condition.message {
            existing.message = new_condition.message;
            changed = true;
        }
        if existing.observed_generation != new_condition.observed_generation {
            existing.observed_generation = new_condition.observed_generation;
            changed = true;
        }
    } else {
        new_condition.last_transition_time = Time(Utc::now());
        new_conditions.push(new_condition);
        changed = true;
    }

    (new_conditions, changed)
}

pub fn find_status_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|condition| condition.type_ == condition_type)
}

/// Returns true when the condition_type is present and set to `True`
pub fn is_status_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_status_condition(conditions, condition_type).is_some_and(|c| c.status == "True")
}

/// The `Available` condition for the outcome of one pass.
///
/// A failed pass always reports `False`. A clean pass is `True` once at least
/// one Contour and one Envoy replica are available.
pub fn available_condition(outcome: Result<(), &Error>, contours: i32, envoys: i32, generation: Option<i64>) -> Condition {
    let (status, reason, message) = match outcome {
        Err(e) => ("False", REASON_FAILED, e.to_string()),
        Ok(()) if contours > 0 && envoys > 0 => (
            "True",
            REASON_AVAILABLE,
            format!("{contours} Contour and {envoys} Envoy replicas available"),
        ),
        Ok(()) => (
            "False",
            REASON_UNAVAILABLE,
            format!("waiting for replicas: {contours} Contour and {envoys} Envoy available"),
        ),
    };
    Condition {
        type_: AVAILABLE_CONDITION.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: Time(Utc::now()),
        observed_generation: generation,
    }
}

/// The status to write back, keeping any condition other than `Available`.
pub fn desired_status(contour: &Contour, outcome: Result<(), &Error>, contours: i32, envoys: i32) -> ContourStatus {
    let current = contour.status.as_ref().map_or_else(Vec::new, |s| s.conditions.clone());
    let condition = available_condition(outcome, contours, envoys, contour.metadata.generation);
    let (conditions, _) = set_status_condition(&current, condition);
    ContourStatus {
        conditions,
        available_contours: contours,
        available_envoys: envoys,
    }
}

async fn fetch<S: ObjectStore, K: Object>(store: &S, contour: &Contour, name: &str) -> Option<K> {
    match store.get::<K>(contour.namespace().as_deref(), name).await {
        Ok(obj) => Some(obj),
        Err(e) => {
            if !is_not_found(&e) {
                debug!("Could not read {} '{}' for status: {}", K::kind(&()), name, e);
            }
            None
        }
    }
}

/// Available Contour and Envoy replicas as reported by the workloads themselves.
pub async fn observe_availability<S: ObjectStore>(store: &S, contour: &Contour) -> (i32, i32) {
    let contours = fetch::<S, Deployment>(store, contour, &contour_deployment_name(contour))
        .await
        .and_then(|d| d.status)
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);

    let envoy_name = envoy_workload_name(contour);
    let envoys = match contour.spec.envoy_workload_type {
        WorkloadType::DaemonSet => fetch::<S, DaemonSet>(store, contour, &envoy_name)
            .await
            .and_then(|d| d.status)
            .and_then(|s| s.number_available),
        WorkloadType::Deployment => fetch::<S, Deployment>(store, contour, &envoy_name)
            .await
            .and_then(|d| d.status)
            .and_then(|s| s.available_replicas),
    }
    .unwrap_or(0);

    (contours, envoys)
}

pub async fn patch_status(client: Client, contour: &Contour, status: &ContourStatus) -> Result<()> {
    let name = contour.name_any();
    let namespace = contour
        .namespace()
        .ok_or_else(|| Error::StdError(StdError::MetadataMissing(format!("namespace of Contour '{name}'"))))?;
    let api: Api<Contour> = Api::namespaced(client, &namespace);

    let patch = Patch::Apply(json!({
        "apiVersion": "operator.projectcontour.io/v1alpha1",
        "kind": "Contour",
        "metadata": {
            "name": name,
            "namespace": namespace
        },
        "status": status
    }));

    api.patch_status(&name, &PatchParams::apply(STATUS_FIELD_MANAGER).force(), &patch)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

    let available = is_status_condition_true(&status.conditions, AVAILABLE_CONDITION);
    info!("Updated Contour {}/{} status, available: {}", namespace, name, available);
    Ok(())
}
