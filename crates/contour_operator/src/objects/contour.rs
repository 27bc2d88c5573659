//! The Contour control plane Deployment.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, KeyToPath, PodSpec, PodTemplateSpec, Probe,
    SecretVolumeSource, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use super::configmap::{configmap_name, CONFIG_FILE};
use super::rbac::contour_service_account_name;
use super::{
    child_meta, field_env, non_root_security_context, placement, string_map, with_server_defaults, CONTOUR_APP,
    CONTOUR_CERT_SECRET, CONTOUR_DEBUG_PORT, CONTOUR_METRICS_PORT, XDS_PORT,
};
use crate::api::v1alpha1::contour::Contour;
use crate::config::OperatorConfig;
use crate::controllers::ensure::{ensure, ensure_deleted, recreate, update_if_changed};
use crate::equality::{deployment_changed, deployment_selectors_differ};
use crate::store::ObjectStore;
use crate::util::errors::Result;
use crate::util::labels::{component_labels, selector_labels, CONFIG_HASH_ANNOTATION};

const CERTS_DIR: &str = "/certs";
const CONFIG_DIR: &str = "/config";
const CONFIG_VOLUME: &str = "contour-config";

pub fn contour_deployment_name(contour: &Contour) -> String {
    contour.child_name("contour")
}

fn contour_args(contour: &Contour) -> Vec<String> {
    let mut args = vec![
        "serve".to_string(),
        "--incluster".to_string(),
        "--xds-address=0.0.0.0".to_string(),
        format!("--xds-port={XDS_PORT}"),
        format!("--contour-cafile={CERTS_DIR}/ca.crt"),
        format!("--contour-cert-file={CERTS_DIR}/tls.crt"),
        format!("--contour-key-file={CERTS_DIR}/tls.key"),
        format!("--config-path={CONFIG_DIR}/{CONFIG_FILE}"),
        format!("--leader-election-resource-name=leader-{}", contour.name_any()),
        format!("--envoy-service-name={}", contour.child_name("envoy")),
        format!("--envoy-service-namespace={}", contour.namespace().unwrap_or_default()),
    ];
    if let Some(class) = contour.spec.ingress_class_name.as_ref() {
        args.push(format!("--ingress-class-name={class}"));
    }
    args
}

fn port(name: &str, number: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: number,
        ..Default::default()
    }
}

fn contour_container(contour: &Contour, config: &OperatorConfig) -> Container {
    with_server_defaults(Container {
        name: CONTOUR_APP.to_string(),
        image: Some(config.contour_image.clone()),
        command: Some(vec!["contour".to_string()]),
        args: Some(contour_args(contour)),
        env: Some(vec![
            field_env("CONTOUR_NAMESPACE", "metadata.namespace"),
            field_env("POD_NAME", "metadata.name"),
        ]),
        ports: Some(vec![
            port("xds", XDS_PORT),
            port("metrics", CONTOUR_METRICS_PORT),
            port("debug", CONTOUR_DEBUG_PORT),
        ]),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::Int(CONTOUR_METRICS_PORT),
                ..Default::default()
            }),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(XDS_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(15),
            period_seconds: Some(10),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: CONTOUR_CERT_SECRET.to_string(),
                mount_path: CERTS_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    })
}

fn contour_volumes(contour: &Contour) -> Vec<Volume> {
    vec![
        Volume {
            name: CONTOUR_CERT_SECRET.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(CONTOUR_CERT_SECRET.to_string()),
                default_mode: Some(0o644),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: configmap_name(contour),
                items: Some(vec![KeyToPath {
                    key: CONFIG_FILE.to_string(),
                    path: CONFIG_FILE.to_string(),
                    ..Default::default()
                }]),
                default_mode: Some(0o644),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

/// `config_hash` is stamped on the pod template so configuration changes roll the pods.
pub fn desired_contour_deployment(contour: &Contour, config: &OperatorConfig, config_hash: &str) -> Deployment {
    let labels = component_labels(contour, CONTOUR_APP, "controller");
    let (node_selector, tolerations) = placement(contour.contour_placement());
    let metrics_port = CONTOUR_METRICS_PORT.to_string();

    Deployment {
        metadata: child_meta(contour, contour_deployment_name(contour), true, labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(contour.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(contour, CONTOUR_APP)),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::String("50%".to_string())),
                    max_unavailable: Some(IntOrString::String("25%".to_string())),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(string_map([
                        (CONFIG_HASH_ANNOTATION, config_hash),
                        ("prometheus.io/scrape", "true"),
                        ("prometheus.io/port", metrics_port.as_str()),
                    ])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![contour_container(contour, config)],
                    volumes: Some(contour_volumes(contour)),
                    service_account_name: Some(contour_service_account_name(contour)),
                    security_context: Some(non_root_security_context()),
                    termination_grace_period_seconds: Some(30),
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

/// Selector drift recreates the Deployment, anything else is updated in place.
pub async fn ensure_contour_deployment<S: ObjectStore>(
    store: &S,
    contour: &Contour,
    config: &OperatorConfig,
    config_hash: &str,
) -> Result<()> {
    let desired = desired_contour_deployment(contour, config, config_hash);
    ensure(store, desired, |current, desired| async move {
        if deployment_selectors_differ(&current, &desired) {
            return recreate(store, contour, &current, &desired).await;
        }
        update_if_changed(store, contour, current, desired, deployment_changed).await
    })
    .await
}

pub async fn ensure_contour_deployment_deleted<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    ensure_deleted::<S, Deployment>(
        store,
        contour.namespace().as_deref(),
        &contour_deployment_name(contour),
        contour,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::contour::ContourSpec;
    use crate::fixtures::{FakeStore, Verb};
    use crate::objects::test_support::{contour, contour_with};
    use crate::util::labels::owner_labels;

    #[test]
    fn args_point_at_the_envoy_service_and_ingress_class() {
        let c = contour_with(
            "demo",
            "ns1",
            ContourSpec {
                ingress_class_name: Some("internal".to_string()),
                ..Default::default()
            },
        );
        let args = contour_args(&c);
        assert!(args.contains(&"--envoy-service-name=envoy-demo".to_string()));
        assert!(args.contains(&"--envoy-service-namespace=ns1".to_string()));
        assert!(args.contains(&"--ingress-class-name=internal".to_string()));
        assert!(args.contains(&"--config-path=/config/contour.yaml".to_string()));
    }

    #[test]
    fn deployment_carries_replicas_and_config_hash() {
        let deployment = desired_contour_deployment(&contour("demo", "ns1"), &OperatorConfig::default(), "abc");
        assert_eq!(deployment.name_any(), "contour-demo");
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let annotations = spec.template.metadata.unwrap().annotations.unwrap();
        assert_eq!(annotations[CONFIG_HASH_ANNOTATION], "abc");
    }

    #[tokio::test]
    async fn config_change_rolls_the_pods() {
        let store = FakeStore::new();
        let c = contour("demo", "ns1");
        let config = OperatorConfig::default();

        ensure_contour_deployment(&store, &c, &config, "one").await.unwrap();
        ensure_contour_deployment(&store, &c, &config, "one").await.unwrap();
        assert_eq!(store.count(Verb::Update, "Deployment"), 0);

        ensure_contour_deployment(&store, &c, &config, "two").await.unwrap();
        assert_eq!(store.count(Verb::Update, "Deployment"), 1);
    }

    #[tokio::test]
    async fn selector_drift_deletes_and_recreates() {
        let store = FakeStore::new();
        let c = contour("demo", "ns1");
        let config = OperatorConfig::default();
        let mut stale = desired_contour_deployment(&c, &config, "one");
        stale.spec.as_mut().unwrap().selector.match_labels = Some(string_map([("app", "a")]));
        stale.metadata.labels = Some(owner_labels(&c));
        store.seed(stale);

        ensure_contour_deployment(&store, &c, &config, "one").await.unwrap();

        let verbs: Vec<Verb> = store
            .calls()
            .into_iter()
            .filter(|call| call.kind == "Deployment")
            .map(|call| call.verb)
            .collect();
        assert_eq!(verbs, [Verb::Get, Verb::Delete, Verb::Create]);
        let live: Deployment = store.object(Some("ns1"), "contour-demo").unwrap();
        assert_eq!(
            live.spec.unwrap().selector.match_labels,
            Some(selector_labels(&c, CONTOUR_APP))
        );
    }
}
