use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{conditions_schema, preserve_unknown_fields_schema};

pub static CONTOUR_FINALIZER: &str = "contour.operator.projectcontour.io/finalizer";

/// Generate the Kubernetes wrapper struct `Contour` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "Contour",
    group = "operator.projectcontour.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "ContourStatus", shortname = "contour")]
#[serde(rename_all = "camelCase")]
pub struct ContourSpec {
    /// Desired number of Contour control plane replicas.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Kind of workload used to run Envoy.
    #[serde(default)]
    pub envoy_workload_type: WorkloadType,

    /// Desired number of Envoy replicas when Envoy runs as a Deployment.
    #[serde(default = "default_replicas")]
    pub envoy_replicas: i32,

    pub ingress_class_name: Option<String>,

    #[serde(default)]
    pub enable_external_name_service: bool,

    #[serde(default)]
    pub network_publishing: NetworkPublishing,

    pub node_placement: Option<NodePlacement>,

    /// Passed through to the Contour configuration file, merged over the operator defaults.
    #[schemars(schema_with = "preserve_unknown_fields_schema")]
    pub runtime_settings: Option<serde_json::Value>,
}

impl Default for ContourSpec {
    fn default() -> Self {
        ContourSpec {
            replicas: default_replicas(),
            envoy_workload_type: WorkloadType::default(),
            envoy_replicas: default_replicas(),
            ingress_class_name: None,
            enable_external_name_service: false,
            network_publishing: NetworkPublishing::default(),
            node_placement: None,
            runtime_settings: None,
        }
    }
}

fn default_replicas() -> i32 {
    2
}

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum WorkloadType {
    #[default]
    DaemonSet,
    Deployment,
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorkloadType::DaemonSet => write!(f, "DaemonSet"),
            WorkloadType::Deployment => write!(f, "Deployment"),
        }
    }
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct NetworkPublishing {
    #[serde(default)]
    pub envoy: EnvoyNetworkPublishing,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyNetworkPublishing {
    #[serde(rename = "type", default)]
    pub type_: NetworkPublishingType,

    #[serde(default)]
    pub load_balancer: LoadBalancerStrategy,

    #[serde(default = "default_node_ports")]
    pub node_ports: Vec<NodePort>,

    #[serde(default = "default_container_ports")]
    pub container_ports: Vec<ContainerPort>,
}

impl Default for EnvoyNetworkPublishing {
    fn default() -> Self {
        EnvoyNetworkPublishing {
            type_: NetworkPublishingType::default(),
            load_balancer: LoadBalancerStrategy::default(),
            node_ports: default_node_ports(),
            container_ports: default_container_ports(),
        }
    }
}

fn default_node_ports() -> Vec<NodePort> {
    vec![
        NodePort {
            name: "http".to_string(),
            port_number: None,
        },
        NodePort {
            name: "https".to_string(),
            port_number: None,
        },
    ]
}

fn default_container_ports() -> Vec<ContainerPort> {
    vec![
        ContainerPort {
            name: "http".to_string(),
            port_number: 8080,
        },
        ContainerPort {
            name: "https".to_string(),
            port_number: 8443,
        },
    ]
}

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum NetworkPublishingType {
    #[default]
    LoadBalancerService,
    NodePortService,
    #[serde(rename = "ClusterIPService")]
    ClusterIpService,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStrategy {
    #[serde(default)]
    pub scope: LoadBalancerScope,
    #[serde(default)]
    pub provider_parameters: ProviderLoadBalancerParameters,
}

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum LoadBalancerScope {
    #[default]
    External,
    Internal,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ProviderLoadBalancerParameters {
    #[serde(rename = "type", default)]
    pub type_: LoadBalancerProviderType,
    pub aws: Option<AwsLoadBalancerParameters>,
    pub azure: Option<ProviderAddressParameters>,
    pub gcp: Option<ProviderAddressParameters>,
}

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum LoadBalancerProviderType {
    #[default]
    #[serde(rename = "AWS")]
    Aws,
    Azure,
    #[serde(rename = "GCP")]
    Gcp,
}

impl fmt::Display for LoadBalancerProviderType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadBalancerProviderType::Aws => write!(f, "AWS"),
            LoadBalancerProviderType::Azure => write!(f, "Azure"),
            LoadBalancerProviderType::Gcp => write!(f, "GCP"),
        }
    }
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct AwsLoadBalancerParameters {
    #[serde(rename = "type", default)]
    pub type_: AwsLoadBalancerType,
}

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum AwsLoadBalancerType {
    #[default]
    Classic,
    #[serde(rename = "NLB")]
    Nlb,
}

/// Azure and GCP share the same knobs: a static address and a subnet for internal balancers.
#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ProviderAddressParameters {
    pub address: Option<String>,
    pub subnet: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePort {
    pub name: String,
    pub port_number: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub name: String,
    pub port_number: i32,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct NodePlacement {
    pub contour: Option<WorkloadPlacement>,
    pub envoy: Option<WorkloadPlacement>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadPlacement {
    pub node_selector: Option<BTreeMap<String, String>>,
    pub tolerations: Option<Vec<Toleration>>,
}

/// The status object of `Contour`
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContourStatus {
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub available_contours: i32,
    #[serde(default)]
    pub available_envoys: i32,
}

impl Contour {
    /// Name of a namespaced child object: `<prefix>-<contour name>`.
    pub fn child_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.name_any())
    }

    /// Name shared by the cluster-scoped RBAC objects of every Contour in this namespace.
    pub fn cluster_scoped_name(&self) -> String {
        format!("contour-{}", self.namespace().unwrap_or_default())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn envoy_placement(&self) -> Option<&WorkloadPlacement> {
        self.spec.node_placement.as_ref().and_then(|p| p.envoy.as_ref())
    }

    pub fn contour_placement(&self) -> Option<&WorkloadPlacement> {
        self.spec.node_placement.as_ref().and_then(|p| p.contour.as_ref())
    }

    pub fn container_port(&self, name: &str) -> Option<i32> {
        self.spec
            .network_publishing
            .envoy
            .container_ports
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.port_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_apply_to_a_sparse_document() {
        let spec: ContourSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec, ContourSpec::default());
        assert_eq!(spec.replicas, 2);
        assert_eq!(spec.envoy_workload_type, WorkloadType::DaemonSet);
        assert_eq!(
            spec.network_publishing.envoy.type_,
            NetworkPublishingType::LoadBalancerService
        );
        assert_eq!(spec.network_publishing.envoy.container_ports.len(), 2);
    }

    #[test]
    fn enum_wire_names_match_the_crd() {
        let publishing: EnvoyNetworkPublishing = serde_json::from_value(serde_json::json!({
            "type": "ClusterIPService",
            "loadBalancer": {"providerParameters": {"type": "GCP", "gcp": {"address": "10.0.0.1"}}}
        }))
        .unwrap();
        assert_eq!(publishing.type_, NetworkPublishingType::ClusterIpService);
        assert_eq!(
            publishing.load_balancer.provider_parameters.type_,
            LoadBalancerProviderType::Gcp
        );
        let aws: AwsLoadBalancerParameters = serde_json::from_value(serde_json::json!({"type": "NLB"})).unwrap();
        assert_eq!(aws.type_, AwsLoadBalancerType::Nlb);
    }

    #[test]
    fn child_names_derive_from_identity() {
        let mut contour = Contour::new("demo", ContourSpec::default());
        contour.metadata.namespace = Some("ns1".to_string());
        assert_eq!(contour.child_name("envoy"), "envoy-demo");
        assert_eq!(contour.cluster_scoped_name(), "contour-ns1");
        assert_eq!(contour.container_port("https"), Some(8443));
    }
}
