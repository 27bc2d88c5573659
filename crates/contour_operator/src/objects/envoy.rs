//! The Envoy data plane, run either as a DaemonSet or as a Deployment.

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, Deployment, DeploymentSpec, DeploymentStrategy,
    RollingUpdateDaemonSet, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, ExecAction, HTTPGetAction, Lifecycle, LifecycleHandler, PodSpec,
    PodTemplateSpec, Probe, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use super::rbac::envoy_service_account_name;
use super::{
    child_meta, field_env, placement, string_map, with_server_defaults, ENVOY_APP, ENVOY_CERT_SECRET,
    ENVOY_METRICS_PORT, ENVOY_SHUTDOWN_PORT, XDS_PORT,
};
use crate::api::v1alpha1::contour::{Contour, WorkloadType};
use crate::config::OperatorConfig;
use crate::controllers::ensure::{ensure, ensure_deleted, recreate, update_if_changed};
use crate::equality::{daemonset_changed, daemonset_selectors_differ, deployment_changed, deployment_selectors_differ};
use crate::store::ObjectStore;
use crate::util::errors::Result;
use crate::util::labels::{component_labels, selector_labels};

const CONFIG_VOLUME: &str = "envoy-config";
const ADMIN_VOLUME: &str = "envoy-admin";
const CONFIG_DIR: &str = "/config";
const CERTS_DIR: &str = "/certs";
const ADMIN_DIR: &str = "/admin";

pub fn envoy_workload_name(contour: &Contour) -> String {
    contour.child_name("envoy")
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Writes the Envoy bootstrap file pointing at the Contour xDS service.
fn init_config_container(contour: &Contour, config: &OperatorConfig) -> Container {
    with_server_defaults(Container {
        name: "envoy-initconfig".to_string(),
        image: Some(config.contour_image.clone()),
        command: Some(strings(&["contour"])),
        args: Some(vec![
            "bootstrap".to_string(),
            format!("{CONFIG_DIR}/envoy.json"),
            format!("--xds-address={}", contour.child_name("contour")),
            format!("--xds-port={XDS_PORT}"),
            "--xds-resource-version=v3".to_string(),
            format!("--resources-dir={CONFIG_DIR}/resources"),
            format!("--envoy-cafile={CERTS_DIR}/ca.crt"),
            format!("--envoy-cert-file={CERTS_DIR}/tls.crt"),
            format!("--envoy-key-file={CERTS_DIR}/tls.key"),
        ]),
        env: Some(vec![field_env("CONTOUR_NAMESPACE", "metadata.namespace")]),
        volume_mounts: Some(vec![
            mount(CONFIG_VOLUME, CONFIG_DIR, false),
            mount(ENVOY_CERT_SECRET, CERTS_DIR, true),
        ]),
        ..Default::default()
    })
}

fn shutdown_manager_container(config: &OperatorConfig) -> Container {
    with_server_defaults(Container {
        name: "shutdown-manager".to_string(),
        image: Some(config.contour_image.clone()),
        command: Some(strings(&["/bin/contour"])),
        args: Some(strings(&["envoy", "shutdown-manager"])),
        lifecycle: Some(Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(strings(&["/bin/contour", "envoy", "shutdown"])),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(vec![mount(ADMIN_VOLUME, ADMIN_DIR, false)]),
        ..Default::default()
    })
}

fn envoy_container(contour: &Contour, config: &OperatorConfig) -> Container {
    let mut ports: Vec<ContainerPort> = contour
        .spec
        .network_publishing
        .envoy
        .container_ports
        .iter()
        .map(|p| ContainerPort {
            name: Some(p.name.clone()),
            container_port: p.port_number,
            ..Default::default()
        })
        .collect();
    ports.push(ContainerPort {
        name: Some("metrics".to_string()),
        container_port: ENVOY_METRICS_PORT,
        ..Default::default()
    });

    with_server_defaults(Container {
        name: ENVOY_APP.to_string(),
        image: Some(config.envoy_image.clone()),
        command: Some(strings(&["envoy"])),
        args: Some(strings(&[
            "-c",
            "/config/envoy.json",
            "--service-cluster $(CONTOUR_NAMESPACE)",
            "--service-node $(ENVOY_POD_NAME)",
            "--log-level info",
        ])),
        env: Some(vec![
            field_env("CONTOUR_NAMESPACE", "metadata.namespace"),
            field_env("ENVOY_POD_NAME", "metadata.name"),
        ]),
        ports: Some(ports),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/ready".to_string()),
                port: IntOrString::Int(ENVOY_METRICS_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(3),
            period_seconds: Some(4),
            ..Default::default()
        }),
        lifecycle: Some(Lifecycle {
            pre_stop: Some(LifecycleHandler {
                http_get: Some(HTTPGetAction {
                    path: Some("/shutdown".to_string()),
                    port: IntOrString::Int(ENVOY_SHUTDOWN_PORT),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            mount(CONFIG_VOLUME, CONFIG_DIR, true),
            mount(ENVOY_CERT_SECRET, CERTS_DIR, true),
            mount(ADMIN_VOLUME, ADMIN_DIR, false),
        ]),
        ..Default::default()
    })
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Pod template shared by both workload kinds.
pub fn envoy_pod_template(contour: &Contour, config: &OperatorConfig) -> PodTemplateSpec {
    let (node_selector, tolerations) = placement(contour.envoy_placement());
    let metrics_port = ENVOY_METRICS_PORT.to_string();

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(component_labels(contour, ENVOY_APP, "data-plane")),
            annotations: Some(string_map([
                ("prometheus.io/scrape", "true"),
                ("prometheus.io/port", metrics_port.as_str()),
                ("prometheus.io/path", "/stats/prometheus"),
            ])),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            init_containers: Some(vec![init_config_container(contour, config)]),
            containers: vec![shutdown_manager_container(config), envoy_container(contour, config)],
            volumes: Some(vec![
                empty_dir(ADMIN_VOLUME),
                empty_dir(CONFIG_VOLUME),
                Volume {
                    name: ENVOY_CERT_SECRET.to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(ENVOY_CERT_SECRET.to_string()),
                        default_mode: Some(0o644),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            service_account_name: Some(envoy_service_account_name(contour)),
            termination_grace_period_seconds: Some(300),
            node_selector,
            tolerations,
            ..Default::default()
        }),
    }
}

fn envoy_selector(contour: &Contour) -> LabelSelector {
    LabelSelector {
        match_labels: Some(selector_labels(contour, ENVOY_APP)),
        ..Default::default()
    }
}

pub fn desired_envoy_daemonset(contour: &Contour, config: &OperatorConfig) -> DaemonSet {
    DaemonSet {
        metadata: child_meta(
            contour,
            envoy_workload_name(contour),
            true,
            component_labels(contour, ENVOY_APP, "data-plane"),
        ),
        spec: Some(DaemonSetSpec {
            selector: envoy_selector(contour),
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDaemonSet {
                    max_surge: Some(IntOrString::Int(0)),
                    max_unavailable: Some(IntOrString::String("10%".to_string())),
                }),
            }),
            template: envoy_pod_template(contour, config),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn desired_envoy_deployment(contour: &Contour, config: &OperatorConfig) -> Deployment {
    Deployment {
        metadata: child_meta(
            contour,
            envoy_workload_name(contour),
            true,
            component_labels(contour, ENVOY_APP, "data-plane"),
        ),
        spec: Some(DeploymentSpec {
            replicas: Some(contour.spec.envoy_replicas),
            selector: envoy_selector(contour),
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::String("10%".to_string())),
                    max_unavailable: Some(IntOrString::Int(0)),
                }),
            }),
            template: envoy_pod_template(contour, config),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn ensure_envoy_daemonset<S: ObjectStore>(store: &S, contour: &Contour, config: &OperatorConfig) -> Result<()> {
    let ns = contour.namespace();
    let name = envoy_workload_name(contour);
    ensure(store, desired_envoy_daemonset(contour, config), |current, desired| async move {
        if daemonset_selectors_differ(&current, &desired) {
            ensure_deleted::<S, Deployment>(store, ns.as_deref(), &name, contour).await?;
            return recreate(store, contour, &current, &desired).await;
        }
        update_if_changed(store, contour, current, desired, daemonset_changed).await
    })
    .await
}

async fn ensure_envoy_deployment<S: ObjectStore>(store: &S, contour: &Contour, config: &OperatorConfig) -> Result<()> {
    let ns = contour.namespace();
    let name = envoy_workload_name(contour);
    ensure(store, desired_envoy_deployment(contour, config), |current, desired| async move {
        if deployment_selectors_differ(&current, &desired) {
            ensure_deleted::<S, DaemonSet>(store, ns.as_deref(), &name, contour).await?;
            return recreate(store, contour, &current, &desired).await;
        }
        update_if_changed(store, contour, current, desired, deployment_changed).await
    })
    .await
}

/// Ensures the Envoy workload of the configured kind and removes the other kind.
pub async fn ensure_envoy_workload<S: ObjectStore>(store: &S, contour: &Contour, config: &OperatorConfig) -> Result<()> {
    let ns = contour.namespace();
    let name = envoy_workload_name(contour);
    match contour.spec.envoy_workload_type {
        WorkloadType::DaemonSet => {
            ensure_deleted::<S, Deployment>(store, ns.as_deref(), &name, contour).await?;
            ensure_envoy_daemonset(store, contour, config).await
        }
        WorkloadType::Deployment => {
            ensure_deleted::<S, DaemonSet>(store, ns.as_deref(), &name, contour).await?;
            ensure_envoy_deployment(store, contour, config).await
        }
    }
}

/// Removes whichever Envoy workload kinds exist.
pub async fn ensure_envoy_workload_deleted<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    let ns = contour.namespace();
    let name = envoy_workload_name(contour);
    let daemonset = ensure_deleted::<S, DaemonSet>(store, ns.as_deref(), &name, contour).await;
    let deployment = ensure_deleted::<S, Deployment>(store, ns.as_deref(), &name, contour).await;
    daemonset.and(deployment)
}
