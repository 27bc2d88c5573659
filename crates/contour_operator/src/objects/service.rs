//! The Contour xDS service and the Envoy service that publishes the data plane.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::{child_meta, CONTOUR_APP, ENVOY_APP, XDS_PORT};
use crate::api::v1alpha1::contour::{
    AwsLoadBalancerType, Contour, LoadBalancerProviderType, LoadBalancerScope, LoadBalancerStrategy,
    NetworkPublishingType,
};
use crate::controllers::ensure::{ensure, ensure_deleted, update_if_changed, ChangedFn};
use crate::equality::{cluster_ip_service_changed, load_balancer_service_changed, node_port_service_changed};
use crate::store::ObjectStore;
use crate::util::errors::Result;
use crate::util::labels::{
    component_labels, selector_labels, AWS_LB_BACKEND_PROTOCOL, AWS_LB_INTERNAL, AWS_LB_PROXY_PROTOCOL, AWS_LB_TYPE,
    AZURE_LB_INTERNAL, AZURE_LB_INTERNAL_SUBNET, GCP_LB_SUBNET, GCP_LB_TYPE,
};

const HTTP_PORT: i32 = 80;
const HTTPS_PORT: i32 = 443;

pub fn contour_service_name(contour: &Contour) -> String {
    contour.child_name("contour")
}

pub fn envoy_service_name(contour: &Contour) -> String {
    contour.child_name("envoy")
}

fn tcp_port(name: &str, port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(target)),
        ..Default::default()
    }
}

/// The xDS endpoint Envoy connects to; always ClusterIP.
pub fn desired_contour_service(contour: &Contour) -> Service {
    Service {
        metadata: child_meta(
            contour,
            contour_service_name(contour),
            true,
            component_labels(contour, CONTOUR_APP, "controller"),
        ),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![tcp_port("xds", XDS_PORT, XDS_PORT)]),
            selector: Some(selector_labels(contour, CONTOUR_APP)),
            session_affinity: Some("None".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Cloud provider annotations for a load-balanced Envoy service.
pub fn load_balancer_annotations(strategy: &LoadBalancerStrategy) -> BTreeMap<String, String> {
    let internal = strategy.scope == LoadBalancerScope::Internal;
    let params = &strategy.provider_parameters;
    let mut annotations = BTreeMap::new();
    let mut set = |key: &str, value: &str| {
        annotations.insert(key.to_string(), value.to_string());
    };

    match params.type_ {
        LoadBalancerProviderType::Aws => {
            set(AWS_LB_BACKEND_PROTOCOL, "tcp");
            match params.aws.as_ref().map(|aws| aws.type_).unwrap_or_default() {
                AwsLoadBalancerType::Nlb => set(AWS_LB_TYPE, "nlb"),
                AwsLoadBalancerType::Classic => set(AWS_LB_PROXY_PROTOCOL, "*"),
            }
            if internal {
                set(AWS_LB_INTERNAL, "0.0.0.0/0");
            }
        }
        LoadBalancerProviderType::Azure => {
            if internal {
                set(AZURE_LB_INTERNAL, "true");
                if let Some(subnet) = params.azure.as_ref().and_then(|p| p.subnet.as_deref()) {
                    set(AZURE_LB_INTERNAL_SUBNET, subnet);
                }
            }
        }
        LoadBalancerProviderType::Gcp => {
            if internal {
                set(GCP_LB_TYPE, "Internal");
                if let Some(subnet) = params.gcp.as_ref().and_then(|p| p.subnet.as_deref()) {
                    set(GCP_LB_SUBNET, subnet);
                }
            }
        }
    }
    annotations
}

fn load_balancer_ip(strategy: &LoadBalancerStrategy) -> Option<String> {
    let params = &strategy.provider_parameters;
    let address = match params.type_ {
        LoadBalancerProviderType::Aws => None,
        LoadBalancerProviderType::Azure => params.azure.as_ref(),
        LoadBalancerProviderType::Gcp => params.gcp.as_ref(),
    };
    address.and_then(|p| p.address.clone())
}

pub fn desired_envoy_service(contour: &Contour) -> Service {
    let publishing = &contour.spec.network_publishing.envoy;
    let node_port = |name: &str| {
        publishing
            .node_ports
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.port_number)
    };
    let mut ports = vec![
        tcp_port("http", HTTP_PORT, contour.container_port("http").unwrap_or(8080)),
        tcp_port("https", HTTPS_PORT, contour.container_port("https").unwrap_or(8443)),
    ];

    let mut meta = child_meta(
        contour,
        envoy_service_name(contour),
        true,
        component_labels(contour, ENVOY_APP, "data-plane"),
    );
    let mut spec = ServiceSpec {
        selector: Some(selector_labels(contour, ENVOY_APP)),
        session_affinity: Some("None".to_string()),
        ..Default::default()
    };

    match publishing.type_ {
        NetworkPublishingType::LoadBalancerService => {
            let annotations = load_balancer_annotations(&publishing.load_balancer);
            meta.annotations = (!annotations.is_empty()).then_some(annotations);
            spec.type_ = Some("LoadBalancer".to_string());
            spec.external_traffic_policy = Some("Local".to_string());
            spec.load_balancer_ip = load_balancer_ip(&publishing.load_balancer);
        }
        NetworkPublishingType::NodePortService => {
            for port in ports.iter_mut() {
                port.node_port = port.name.as_deref().and_then(node_port);
            }
            spec.type_ = Some("NodePort".to_string());
            spec.external_traffic_policy = Some("Local".to_string());
        }
        NetworkPublishingType::ClusterIpService => {
            spec.type_ = Some("ClusterIP".to_string());
        }
    }
    spec.ports = Some(ports);

    Service {
        metadata: meta,
        spec: Some(spec),
        ..Default::default()
    }
}

pub async fn ensure_contour_service<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    ensure(store, desired_contour_service(contour), |current, desired| {
        update_if_changed(store, contour, current, desired, cluster_ip_service_changed)
    })
    .await
}

/// Uses the comparison matching the publishing type of the Envoy service.
pub async fn ensure_envoy_service<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    let changed: ChangedFn<Service> = match contour.spec.network_publishing.envoy.type_ {
        NetworkPublishingType::LoadBalancerService => load_balancer_service_changed,
        NetworkPublishingType::NodePortService => node_port_service_changed,
        NetworkPublishingType::ClusterIpService => cluster_ip_service_changed,
    };
    ensure(store, desired_envoy_service(contour), |current, desired| {
        update_if_changed(store, contour, current, desired, changed)
    })
    .await
}

pub async fn ensure_contour_service_deleted<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    ensure_deleted::<S, Service>(store, contour.namespace().as_deref(), &contour_service_name(contour), contour).await
}

pub async fn ensure_envoy_service_deleted<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    ensure_deleted::<S, Service>(store, contour.namespace().as_deref(), &envoy_service_name(contour), contour).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::contour::{
        AwsLoadBalancerParameters, ContourSpec, EnvoyNetworkPublishing, NetworkPublishing, NodePort,
        ProviderAddressParameters, ProviderLoadBalancerParameters,
    };
    use crate::fixtures::{FakeStore, Verb};
    use crate::objects::test_support::{contour, contour_with};

    fn publishing(c: &mut Contour) -> &mut EnvoyNetworkPublishing {
        &mut c.spec.network_publishing.envoy
    }

    #[test]
    fn aws_classic_is_the_default() {
        let annotations = load_balancer_annotations(&LoadBalancerStrategy::default());
        assert_eq!(annotations[AWS_LB_BACKEND_PROTOCOL], "tcp");
        assert_eq!(annotations[AWS_LB_PROXY_PROTOCOL], "*");
        assert!(!annotations.contains_key(AWS_LB_INTERNAL));
    }

    #[test]
    fn internal_nlb() {
        let strategy = LoadBalancerStrategy {
            scope: LoadBalancerScope::Internal,
            provider_parameters: ProviderLoadBalancerParameters {
                aws: Some(AwsLoadBalancerParameters {
                    type_: AwsLoadBalancerType::Nlb,
                }),
                ..Default::default()
            },
        };
        let annotations = load_balancer_annotations(&strategy);
        assert_eq!(annotations[AWS_LB_TYPE], "nlb");
        assert_eq!(annotations[AWS_LB_INTERNAL], "0.0.0.0/0");
        assert!(!annotations.contains_key(AWS_LB_PROXY_PROTOCOL));
    }

    #[test]
    fn internal_gcp_with_address_and_subnet() {
        let mut c = contour("demo", "ns1");
        publishing(&mut c).load_balancer = LoadBalancerStrategy {
            scope: LoadBalancerScope::Internal,
            provider_parameters: ProviderLoadBalancerParameters {
                type_: LoadBalancerProviderType::Gcp,
                gcp: Some(ProviderAddressParameters {
                    address: Some("10.0.0.9".to_string()),
                    subnet: Some("edge".to_string()),
                }),
                ..Default::default()
            },
        };

        let service = desired_envoy_service(&c);

        let annotations = service.metadata.annotations.unwrap();
        assert_eq!(annotations[GCP_LB_TYPE], "Internal");
        assert_eq!(annotations[GCP_LB_SUBNET], "edge");
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(spec.load_balancer_ip.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn node_port_numbers_come_from_the_spec() {
        let mut c = contour("demo", "ns1");
        publishing(&mut c).type_ = NetworkPublishingType::NodePortService;
        publishing(&mut c).node_ports = vec![
            NodePort {
                name: "http".to_string(),
                port_number: Some(30080),
            },
            NodePort {
                name: "https".to_string(),
                port_number: None,
            },
        ];

        let ports = desired_envoy_service(&c).spec.unwrap().ports.unwrap();

        assert_eq!(ports[0].node_port, Some(30080));
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8080)));
        assert_eq!(ports[1].node_port, None);
    }

    #[tokio::test]
    async fn services_are_stable_after_the_server_assigns_ips_and_node_ports() {
        let store = FakeStore::new();
        let c = contour("demo", "ns1");
        ensure_contour_service(&store, &c).await.unwrap();
        ensure_envoy_service(&store, &c).await.unwrap();

        ensure_contour_service(&store, &c).await.unwrap();
        ensure_envoy_service(&store, &c).await.unwrap();

        assert_eq!(store.count(Verb::Create, "Service"), 2);
        assert_eq!(store.count(Verb::Update, "Service"), 0);
        let envoy: Service = store.object(Some("ns1"), "envoy-demo").unwrap();
        assert!(envoy.spec.unwrap().ports.unwrap()[0].node_port.is_some());
    }

    #[tokio::test]
    async fn publishing_switch_updates_in_place_and_keeps_the_cluster_ip() {
        let store = FakeStore::new();
        ensure_envoy_service(&store, &contour("demo", "ns1")).await.unwrap();
        let before: Service = store.object(Some("ns1"), "envoy-demo").unwrap();

        let c = contour_with(
            "demo",
            "ns1",
            ContourSpec {
                network_publishing: NetworkPublishing {
                    envoy: EnvoyNetworkPublishing {
                        type_: NetworkPublishingType::ClusterIpService,
                        ..Default::default()
                    },
                },
                ..Default::default()
            },
        );
        ensure_envoy_service(&store, &c).await.unwrap();

        assert_eq!(store.count(Verb::Update, "Service"), 1);
        let after: Service = store.object(Some("ns1"), "envoy-demo").unwrap();
        assert!(after.metadata.annotations.unwrap_or_default().is_empty());
        let (before, after) = (before.spec.unwrap(), after.spec.unwrap());
        assert_eq!(after.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(after.cluster_ip, before.cluster_ip);
        assert!(after.ports.unwrap().iter().all(|p| p.node_port.is_none()));
        assert_eq!(after.external_traffic_policy, None);
    }
}
