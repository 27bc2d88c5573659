use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    batch::v1::Job,
    core::v1::{ConfigMap, Service, ServiceAccount},
    rbac::v1::{Role, RoleBinding},
};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{self, finalizer, Event as Finalizer},
        reflector::ObjectRef,
        watcher::{self, Config},
    },
    Resource,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::*;

use crate::api::v1alpha1::contour::{Contour, CONTOUR_FINALIZER};
use crate::config::OperatorConfig;
use crate::controllers::contour::{ensure_contour, ensure_contour_deleted};
use crate::controllers::validation::validate;
use crate::store::KubeStore;
use crate::util::contour_status::{desired_status, observe_availability, patch_status};
use crate::util::errors::{Error, Result, StdError};
use crate::util::labels::{OWNING_CONTOUR_NAME, OWNING_CONTOUR_NAMESPACE};
use crate::util::metrics::Metrics;

impl Contour {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        ensure_contour(&ctx.store, self, &ctx.config).await?;
        Ok(Action::requeue(ctx.config.resync_interval))
    }

    // Finalizer cleanup: the finalizer only goes away once every child is gone
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        let published = recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "DeleteRequested".into(),
                    note: Some(format!("Delete `{}`", self.name_any())),
                    action: "Deleting".into(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await;
        if let Err(e) = published {
            warn!("failed to publish delete event for Contour '{}': {}", self.name_any(), e);
        }

        ensure_contour_deleted(&ctx.store, self).await?;
        Ok(Action::await_change())
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client, config: OperatorConfig) -> Result<Arc<Context>> {
        let metrics = Metrics::new()
            .and_then(|m| m.register(&self.registry))
            .map_err(StdError::MetricsError)?;
        Ok(Arc::new(Context {
            store: KubeStore::new(client.clone()),
            client,
            config,
            metrics,
            diagnostics: self.diagnostics.clone(),
        }))
    }
}

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Object store the ensure functions run against
    pub store: KubeStore,
    pub config: OperatorConfig,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

/// Writes the outcome of a pass to the Contour status. Failures are only logged.
async fn update_status(ctx: &Context, contour: &Contour, outcome: Result<(), &Error>) {
    let (contours, envoys) = observe_availability(&ctx.store, contour).await;
    let status = desired_status(contour, outcome, contours, envoys);
    if contour.status.as_ref() == Some(&status) {
        return;
    }
    if let Err(e) = patch_status(ctx.client.clone(), contour, &status).await {
        warn!("failed to update status of Contour '{}': {}", contour.name_any(), e);
    }
}

/// Retryable errors become a delayed requeue, anything else goes to the error policy.
fn requeue_or_fail(contour: &Contour, ctx: &Context, error: Error) -> Result<Action> {
    match error.requeue_after() {
        Some(duration) => {
            ctx.metrics.reconcile_failure(contour, &error);
            info!("Retrying Contour '{}' in {:?}", contour.name_any(), duration);
            Ok(Action::requeue(duration))
        }
        None => Err(error),
    }
}

pub async fn reconcile(contour: Arc<Contour>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(&contour.name_any());
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = contour
        .namespace()
        .ok_or_else(|| StdError::MetadataMissing(format!("namespace of Contour '{}'", contour.name_any())))?;
    let contours: Api<Contour> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling Contour \"{}\" in {}", contour.name_any(), ns);

    let deleting = contour.is_deleting();
    if !deleting {
        if let Err(e) = validate(&ctx.store, &contour).await {
            update_status(&ctx, &contour, Err(&e)).await;
            return Err(e);
        }
    }

    let result = finalizer(&contours, CONTOUR_FINALIZER, contour.clone(), |event| async {
        match event {
            Finalizer::Apply(contour) => contour.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(contour) => contour.cleanup(ctx.clone()).await,
        }
    })
    .await;

    match result {
        Ok(action) => {
            if !deleting {
                update_status(&ctx, &contour, Ok(())).await;
            }
            Ok(action)
        }
        Err(finalizer::Error::ApplyFailed(e)) => {
            update_status(&ctx, &contour, Err(&e)).await;
            requeue_or_fail(&contour, &ctx, e)
        }
        Err(finalizer::Error::CleanupFailed(e)) => requeue_or_fail(&contour, &ctx, e),
        Err(e) => Err(Error::StdError(StdError::FinalizerError(Box::new(e)))),
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "contour-operator".into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

fn error_policy(contour: Arc<Contour>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&contour, error);
    Action::requeue(ctx.config.error_requeue)
}

/// Maps a child object back to the Contour named by its owner labels.
fn contour_for<K: Resource>(obj: K) -> Option<ObjectRef<Contour>> {
    let labels = obj.meta().labels.as_ref()?;
    let name = labels.get(OWNING_CONTOUR_NAME)?;
    let namespace = labels.get(OWNING_CONTOUR_NAMESPACE)?;
    Some(ObjectRef::new(name).within(namespace))
}

fn owned() -> watcher::Config {
    watcher::Config::default().labels(OWNING_CONTOUR_NAME)
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State, client: Client, config: OperatorConfig) -> Result<()> {
    let contours = Api::<Contour>::all(client.clone());
    if let Err(e) = contours.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        return Err(Error::StdError(StdError::KubeError(e)));
    }

    let ctx = state.to_context(client.clone(), config)?;

    Controller::new(contours, Config::default().any_semantic())
        .watches(Api::<Deployment>::all(client.clone()), owned(), contour_for)
        .watches(Api::<DaemonSet>::all(client.clone()), owned(), contour_for)
        .watches(Api::<Service>::all(client.clone()), owned(), contour_for)
        .watches(Api::<ConfigMap>::all(client.clone()), owned(), contour_for)
        .watches(Api::<Job>::all(client.clone()), owned(), contour_for)
        .watches(Api::<ServiceAccount>::all(client.clone()), owned(), contour_for)
        .watches(Api::<Role>::all(client.clone()), owned(), contour_for)
        .watches(Api::<RoleBinding>::all(client.clone()), owned(), contour_for)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::envoy::desired_envoy_daemonset;
    use crate::objects::test_support::contour;

    #[test]
    fn children_map_back_to_their_contour() {
        let c = contour("demo", "ns1");
        let daemonset = desired_envoy_daemonset(&c, &OperatorConfig::default());
        let reference = contour_for(daemonset).unwrap();
        assert_eq!(reference.name, "demo");
        assert_eq!(reference.namespace.as_deref(), Some("ns1"));
    }

    #[test]
    fn unlabelled_objects_are_ignored() {
        assert!(contour_for(ConfigMap::default()).is_none());
    }

    #[test]
    fn diagnostics_serialize_the_last_event() {
        let value = serde_json::to_value(Diagnostics::default()).unwrap();
        assert!(value.get("last_event").is_some());
        assert!(value.get("reporter").is_none());
    }
}
